//! Monte Carlo estimate of whether an early stop gets the attacker ahead of
//! a rival within `H` laps.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, UndercutError};
use crate::model::DegradationModel;
use crate::outlap::OutlapModel;
use crate::pit_loss::PitLossModel;
use crate::scope::ScopeLevel;
use crate::stats;
use crate::store::ParameterStore;

pub const MAX_HORIZON: u32 = 5;
pub const MAX_SAMPLES: u32 = 10_000;

fn default_samples() -> u32 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    #[serde(default)]
    pub circuit: Option<String>,
    /// Compound the attacker fits at the stop.
    pub compound_new: String,
    /// Compound the rival is currently running; the attacker's when absent.
    #[serde(default)]
    pub compound_rival: Option<String>,
    /// Cushion in seconds the attacker has to play with; added to the rival's
    /// elapsed time.
    pub current_gap_s: f64,
    pub tyre_age_rival: u32,
    pub horizon: u32,
    pub p_pit_next: f64,
    #[serde(default = "default_samples")]
    pub samples: u32,
    #[serde(default)]
    pub rng_seed: u64,
}

impl SimulationRequest {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_HORIZON).contains(&self.horizon) {
            return Err(UndercutError::invalid(
                "horizon",
                format!("must be in [1, {}], got {}", MAX_HORIZON, self.horizon),
            ));
        }
        if !(0.0..=1.0).contains(&self.p_pit_next) {
            return Err(UndercutError::invalid(
                "p_pit_next",
                format!("must be in [0, 1], got {}", self.p_pit_next),
            ));
        }
        if !(1..=MAX_SAMPLES).contains(&self.samples) {
            return Err(UndercutError::invalid(
                "samples",
                format!("must be in [1, {}], got {}", MAX_SAMPLES, self.samples),
            ));
        }
        if !self.current_gap_s.is_finite() {
            return Err(UndercutError::invalid("current_gap_s", "must be finite"));
        }
        Ok(())
    }
}

/// Realized counts of the rival's response across all draws.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioDistribution {
    pub b_stays_out: u32,
    pub b_pits_lap1: u32,
}

/// Which stored scope fed each model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScopesUsed {
    pub degradation: ScopeLevel,
    pub rival_degradation: ScopeLevel,
    pub outlap: ScopeLevel,
    pub pit_loss: ScopeLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationResult {
    pub p_undercut: f64,
    pub expected_margin_s: f64,
    pub ci_low_s: f64,
    pub ci_high_s: f64,
    pub horizon: u32,
    pub samples: u32,
    pub scenario_distribution: ScenarioDistribution,
    pub scopes_used: ScopesUsed,
}

/// Models resolved for one request, ready to sample.
struct ResolvedModels {
    attacker_deg: DegradationModel,
    rival_deg: DegradationModel,
    outlap: OutlapModel,
    pit_loss: PitLossModel,
    scopes: ScopesUsed,
}

/// Stateless over calls: every `simulate` seeds its own generator, so the
/// engine can be shared across threads.
#[derive(Debug, Clone)]
pub struct SimulationEngine {
    store: Arc<ParameterStore>,
}

impl SimulationEngine {
    pub fn new(store: Arc<ParameterStore>) -> Self {
        Self { store }
    }

    pub fn simulate(&self, request: &SimulationRequest) -> Result<SimulationResult> {
        request.validate()?;
        let models = self.resolve(request)?;
        let mut rng = ChaCha8Rng::seed_from_u64(request.rng_seed);
        run(request, &models, &mut rng)
    }

    /// Runs H = 1..=max_horizon with the same seed and inputs.
    pub fn sweep_horizons(
        &self,
        request: &SimulationRequest,
        max_horizon: u32,
    ) -> Result<Vec<SimulationResult>> {
        (1..=max_horizon)
            .map(|horizon| {
                self.simulate(&SimulationRequest {
                    horizon,
                    ..request.clone()
                })
            })
            .collect()
    }

    fn resolve(&self, request: &SimulationRequest) -> Result<ResolvedModels> {
        let circuit = request.circuit.as_deref();
        let compound_rival = request
            .compound_rival
            .as_deref()
            .unwrap_or(&request.compound_new);

        let attacker = self
            .store
            .get_degradation_params(circuit, Some(&request.compound_new))?;
        let rival = self.store.get_degradation_params(circuit, Some(compound_rival))?;
        let outlap = self
            .store
            .get_outlap_params(circuit, Some(&request.compound_new))?;
        let pit_loss = self.store.get_pit_loss_params()?;

        let scopes = ScopesUsed {
            degradation: attacker.level,
            rival_degradation: rival.level,
            outlap: outlap.level,
            pit_loss: pit_loss.level,
        };
        debug!(?scopes, "resolved simulation parameters");

        Ok(ResolvedModels {
            attacker_deg: DegradationModel::from_parameters((*attacker.params).clone()),
            rival_deg: DegradationModel::from_parameters((*rival.params).clone()),
            outlap: OutlapModel::from_parameters((*outlap.params).clone())?,
            pit_loss: PitLossModel::from_parameters((*pit_loss.params).clone())?,
            scopes,
        })
    }
}

fn residual(std: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, std).map_err(|e| UndercutError::invalid("degradation.rmse", e.to_string()))
}

fn run(
    request: &SimulationRequest,
    models: &ResolvedModels,
    rng: &mut ChaCha8Rng,
) -> Result<SimulationResult> {
    let attacker_noise = residual(models.attacker_deg.residual_std())?;
    let rival_noise = residual(models.rival_deg.residual_std())?;
    let horizon = request.horizon;
    let rival_age = request.tyre_age_rival as f64;

    let mut margins = Vec::with_capacity(request.samples as usize);
    let mut scenarios = ScenarioDistribution::default();
    let mut successes = 0u32;

    for _ in 0..request.samples {
        let pit_loss = models.pit_loss.sample_one(rng);
        let outlap_penalty = models.outlap.sample_one(rng);
        let rival_pits = rng.gen_bool(request.p_pit_next);
        if rival_pits {
            scenarios.b_pits_lap1 += 1;
        } else {
            scenarios.b_stays_out += 1;
        }

        // the attacker stopped at lap 0
        let mut attacker = pit_loss + outlap_penalty;
        let mut rival = request.current_gap_s;

        for lap in 1..=horizon {
            let lap = lap as f64;
            attacker += models.attacker_deg.predict(lap) + attacker_noise.sample(rng);

            let rival_lap = if rival_pits {
                if lap == 1.0 {
                    rival += pit_loss + outlap_penalty;
                }
                models.attacker_deg.predict(lap - 1.0)
            } else {
                models.rival_deg.predict(rival_age + lap)
            };
            rival += rival_lap + rival_noise.sample(rng);
        }

        let margin = rival - attacker;
        if margin > 0.0 {
            successes += 1;
        }
        margins.push(margin);
    }

    let expected_margin_s = stats::mean(&margins).unwrap_or(0.0);
    margins.sort_by(f64::total_cmp);
    let ci_low_s = stats::percentile_sorted(&margins, 5.0).unwrap_or(expected_margin_s);
    let ci_high_s = stats::percentile_sorted(&margins, 95.0).unwrap_or(expected_margin_s);

    Ok(SimulationResult {
        p_undercut: successes as f64 / request.samples as f64,
        expected_margin_s,
        ci_low_s,
        ci_high_s,
        horizon,
        samples: request.samples,
        scenario_distribution: scenarios,
        scopes_used: models.scopes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::params::{DegradationParameters, OutlapParameters, PitLossParameters};
    use crate::scope::ScopeKey;
    use chrono::Utc;

    fn request() -> SimulationRequest {
        SimulationRequest {
            circuit: Some("bahrain".to_string()),
            compound_new: "SOFT".to_string(),
            compound_rival: None,
            current_gap_s: 20.0,
            tyre_age_rival: 15,
            horizon: 2,
            p_pit_next: 0.3,
            samples: 500,
            rng_seed: 11,
        }
    }

    fn engine() -> SimulationEngine {
        SimulationEngine::new(Arc::new(ParameterStore::new(&Settings::default())))
    }

    #[test]
    fn rejects_out_of_range_inputs() {
        let engine = engine();
        for (bad, name) in [
            (SimulationRequest { horizon: 0, ..request() }, "horizon"),
            (SimulationRequest { horizon: 6, ..request() }, "horizon"),
            (SimulationRequest { p_pit_next: 1.01, ..request() }, "p_pit_next"),
            (SimulationRequest { p_pit_next: f64::NAN, ..request() }, "p_pit_next"),
            (SimulationRequest { samples: 0, ..request() }, "samples"),
            (SimulationRequest { samples: 10_001, ..request() }, "samples"),
        ] {
            match engine.simulate(&bad) {
                Err(UndercutError::InvalidParameter { name: got, .. }) => assert_eq!(got, name),
                other => panic!("expected InvalidParameter for {}, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn boundary_inputs_are_accepted() {
        let engine = engine();
        for req in [
            SimulationRequest { horizon: 1, samples: 1, p_pit_next: 0.0, ..request() },
            SimulationRequest { horizon: 5, samples: 10_000, p_pit_next: 1.0, ..request() },
        ] {
            engine.simulate(&req).unwrap();
        }
    }

    #[test]
    fn scenario_counts_cover_every_draw() {
        let result = engine().simulate(&request()).unwrap();
        let s = result.scenario_distribution;
        assert_eq!(s.b_stays_out + s.b_pits_lap1, 500);
        assert!(s.b_pits_lap1 > 0 && s.b_stays_out > 0);
        assert!((0.0..=1.0).contains(&result.p_undercut));
        assert!(result.ci_low_s <= result.expected_margin_s);
        assert!(result.expected_margin_s <= result.ci_high_s);
    }

    #[test]
    fn reports_default_scopes_on_empty_store() {
        let result = engine().simulate(&request()).unwrap();
        assert_eq!(
            result.scopes_used,
            ScopesUsed {
                degradation: ScopeLevel::Default,
                rival_degradation: ScopeLevel::Default,
                outlap: ScopeLevel::Default,
                pit_loss: ScopeLevel::Default,
            }
        );
    }

    fn linear_deg(compound: &str, b: f64) -> DegradationParameters {
        DegradationParameters {
            scope: ScopeKey::compound(compound),
            a: 0.0,
            b,
            c: 0.0,
            r_squared: 0.9,
            rmse: 0.0,
            sample_count: 50,
            fitted_at: Utc::now(),
            low_confidence: false,
        }
    }

    /// Linear degradation, no residual noise and near-constant stop costs:
    /// pit loss 20.0, outlap penalty 0.5.
    fn deterministic_engine() -> SimulationEngine {
        let store = ParameterStore::new(&Settings::default());
        store.save(linear_deg("SOFT", 0.1)).unwrap();
        store.save(linear_deg("HARD", 0.5)).unwrap();
        store
            .save(OutlapParameters {
                scope: ScopeKey::compound("SOFT"),
                mean: 0.5,
                std: 1e-12,
                sample_count: 50,
                fitted_at: Utc::now(),
            })
            .unwrap();
        store
            .save(PitLossParameters {
                mean: 20.0,
                std: 1e-12,
                sample_count: 50,
                fitted_at: Utc::now(),
            })
            .unwrap();
        SimulationEngine::new(Arc::new(store))
    }

    #[test]
    fn rival_staying_out_gives_exact_margin() {
        let req = SimulationRequest {
            current_gap_s: 21.0,
            tyre_age_rival: 10,
            horizon: 1,
            p_pit_next: 0.0,
            samples: 10,
            ..request()
        };
        let result = deterministic_engine().simulate(&req).unwrap();
        assert_eq!(result.scopes_used.degradation, ScopeLevel::Compound);
        assert_eq!(result.scopes_used.outlap, ScopeLevel::Compound);
        // rival: 21 + 0.1·11 = 22.1; attacker: 20 + 0.5 + 0.1 = 20.6
        assert!((result.expected_margin_s - 1.5).abs() < 1e-9);
        assert!((result.ci_low_s - 1.5).abs() < 1e-9);
        assert!((result.ci_high_s - 1.5).abs() < 1e-9);
        assert_eq!(result.p_undercut, 1.0);
    }

    #[test]
    fn rival_pitting_pays_once_and_runs_the_new_compound() {
        // The rival is on HARD (b = 0.5) but after stopping runs the
        // attacker's SOFT curve one lap behind on age. Both pay the same
        // stop, so over three laps the margin is gap − 3·0.1.
        let req = SimulationRequest {
            compound_rival: Some("HARD".to_string()),
            current_gap_s: 5.0,
            tyre_age_rival: 20,
            horizon: 3,
            p_pit_next: 1.0,
            samples: 25,
            ..request()
        };
        let result = deterministic_engine().simulate(&req).unwrap();
        assert_eq!(result.scenario_distribution.b_pits_lap1, 25);
        assert_eq!(result.scopes_used.rival_degradation, ScopeLevel::Compound);
        assert!((result.expected_margin_s - 4.7).abs() < 1e-9);
        assert!((result.ci_low_s - 4.7).abs() < 1e-9);
        assert!((result.ci_high_s - 4.7).abs() < 1e-9);

        let negative_gap = deterministic_engine()
            .simulate(&SimulationRequest { current_gap_s: 0.2, ..req })
            .unwrap();
        assert!((negative_gap.expected_margin_s + 0.1).abs() < 1e-9);
        assert_eq!(negative_gap.p_undercut, 0.0);
    }

    #[test]
    fn sweep_covers_each_horizon() {
        let results = engine().sweep_horizons(&request(), 5).unwrap();
        let horizons: Vec<u32> = results.iter().map(|r| r.horizon).collect();
        assert_eq!(horizons, vec![1, 2, 3, 4, 5]);
    }
}
