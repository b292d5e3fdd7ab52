use std::sync::Arc;

use undercut::data::{LapRecord, PitEvent};
use undercut::{
    DegradationModel, ParameterStore, ScopeLevel, Session, Settings, SimulationEngine,
    SimulationRequest, TrainingPipeline, TyreAgeCalculator, UndercutError,
};

/// A 40-lap race: SOFT to lap 14, stop, HARD to the flag. Laps 25-26 run
/// behind the safety car and one driver loses time in traffic on lap 20.
fn bahrain(drivers: usize) -> Session {
    let mut laps = Vec::new();
    let mut pits = Vec::new();
    for d in 0..drivers {
        let driver = format!("D{:02}", d);
        let base = 93.0 + d as f64 * 0.15;
        for lap in 1..=40u32 {
            let (compound, age) = if lap < 15 { ("SOFT", lap) } else { ("HARD", lap - 14) };
            let age = age as f64;
            let wobble = ((lap + d as u32) % 3) as f64 * 0.04;
            let mut time = base + 0.05 * age + 0.003 * age * age + wobble;
            if lap == 15 {
                time += 1.8;
            }
            let mut record = LapRecord::new(driver.clone(), lap, time).with_compound(compound);
            if lap == 25 || lap == 26 {
                record = record.with_track_status("4");
                record.lap_time += 35.0;
            }
            if d == 0 && lap == 20 {
                record.lap_time += 6.0;
            }
            laps.push(record);
        }
        pits.push(PitEvent::new(driver.clone(), 15).with_time_loss(22.0 + (d % 4) as f64 * 0.5));
        // a double stop recorded twice on the same lap
        if d == 1 {
            pits.push(PitEvent::new(driver, 15).with_time_loss(22.4));
        }
    }
    Session {
        circuit: "bahrain".to_string(),
        laps,
        pits,
    }
}

#[test]
fn tyre_ages_follow_the_race() {
    let session = bahrain(3);
    let aged = TyreAgeCalculator::default().compute_tyre_age(&session.laps, &session.pits);
    let d1: Vec<u32> = aged
        .iter()
        .filter(|a| a.lap.competitor == "D01")
        .map(|a| a.tyre_age)
        .collect();

    assert_eq!(&d1[..14], &(1..=14).collect::<Vec<_>>()[..]);
    // one reset on lap 15 despite the duplicate event
    assert_eq!(&d1[14..24], &(1..=10).collect::<Vec<_>>()[..]);
    // safety car laps 25 and 26 hold age 10
    assert_eq!(&d1[24..27], &[10, 10, 11]);
}

#[test]
fn trained_parameters_drive_the_simulation() {
    let settings = Settings::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model_params.json");

    let store = ParameterStore::open(&path, &settings).unwrap();
    let report = TrainingPipeline::new(&settings)
        .train(&[bahrain(8)], &store)
        .unwrap();
    assert!(report.pit_loss_fitted);
    assert!(path.exists());

    // reopen to make sure the engine only sees what was persisted
    let store = Arc::new(ParameterStore::open(&path, &settings).unwrap());
    let soft = store.get_degradation_params(Some("bahrain"), Some("SOFT")).unwrap();
    let model = DegradationModel::from_parameters((*soft.params).clone());
    assert!(model.is_increasing_over(1.0, 14.0));
    assert!(model.fresh_tire_advantage(15.0, 2.0) > 0.0);

    let engine = SimulationEngine::new(Arc::clone(&store));
    let request = SimulationRequest {
        circuit: Some("bahrain".to_string()),
        compound_new: "HARD".to_string(),
        compound_rival: Some("SOFT".to_string()),
        current_gap_s: 24.0,
        tyre_age_rival: 14,
        horizon: 3,
        p_pit_next: 0.0,
        samples: 2000,
        rng_seed: 7,
    };
    let result = engine.simulate(&request).unwrap();
    assert_eq!(result.scopes_used.degradation, ScopeLevel::CircuitCompound);
    assert_eq!(result.scopes_used.rival_degradation, ScopeLevel::CircuitCompound);
    assert_eq!(result.scopes_used.outlap, ScopeLevel::CircuitCompound);
    assert_eq!(result.scopes_used.pit_loss, ScopeLevel::Global);

    let elsewhere = engine
        .simulate(&SimulationRequest {
            circuit: Some("jeddah".to_string()),
            ..request.clone()
        })
        .unwrap();
    assert_eq!(elsewhere.scopes_used.degradation, ScopeLevel::Compound);

    let sweep = engine.sweep_horizons(&request, 5).unwrap();
    assert_eq!(sweep.len(), 5);
    assert!(sweep.iter().all(|r| (0.0..=1.0).contains(&r.p_undercut)));
}

#[test]
fn invalid_requests_fail_before_sampling() {
    let engine = SimulationEngine::new(Arc::new(ParameterStore::new(&Settings::default())));
    let err = engine
        .simulate(&SimulationRequest {
            circuit: None,
            compound_new: "SOFT".to_string(),
            compound_rival: None,
            current_gap_s: 3.0,
            tyre_age_rival: 10,
            horizon: 9,
            p_pit_next: 0.5,
            samples: 100,
            rng_seed: 1,
        })
        .unwrap_err();
    match err {
        UndercutError::InvalidParameter { name, reason } => {
            assert_eq!(name, "horizon");
            assert!(reason.contains('9'));
        }
        other => panic!("unexpected error {:?}", other),
    }
}
