//! Offline fitting: raw session data in, scoped parameters out.
//!
//! Every session contributes to its (circuit, compound) scope, to the
//! compound scope pooled over circuits, and to the global scope. A scope
//! without enough data is skipped; the store's fallback covers it.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::data::{LapRecord, PitEvent};
use crate::error::{Result, UndercutError};
use crate::model::{DegradationModel, DegradationSample};
use crate::outlap::{outlap_penalties, OutlapModel};
use crate::pit_loss::PitLossModel;
use crate::scope::ScopeKey;
use crate::store::ParameterStore;
use crate::tyre_age::{stints, AgedLap, TireStint, TyreAgeCalculator};

/// Laps and stops of one race at one circuit.
#[derive(Debug, Clone)]
pub struct Session {
    pub circuit: String,
    pub laps: Vec<LapRecord>,
    pub pits: Vec<PitEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingReport {
    pub degradation_fitted: Vec<ScopeKey>,
    pub outlap_fitted: Vec<ScopeKey>,
    pub pit_loss_fitted: bool,
    /// Scopes skipped, with the reason.
    pub skipped: Vec<(String, String)>,
}

/// Training data for one scope, accumulated across sessions.
#[derive(Debug, Default)]
struct ScopeData {
    degradation: Vec<DegradationSample>,
    penalties: Vec<f64>,
}

pub struct TrainingPipeline<'a> {
    settings: &'a Settings,
    calculator: TyreAgeCalculator,
}

impl<'a> TrainingPipeline<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            calculator: TyreAgeCalculator::new(settings.tyre_age.clone()),
        }
    }

    pub fn train(&self, sessions: &[Session], store: &ParameterStore) -> Result<TrainingReport> {
        let mut scopes: HashMap<ScopeKey, ScopeData> = HashMap::new();
        let mut pit_losses = Vec::new();

        for session in sessions {
            let aged = self.calculator.compute_tyre_age(&session.laps, &session.pits);
            let stints = stints(&aged);
            debug!(circuit = %session.circuit, stints = stints.len(), "prepared session");

            for (compound, group) in group_by_compound(&stints) {
                let samples = degradation_samples(&aged, &group);
                let penalties = outlap_penalties(group.iter().copied());

                // a blank circuit normalizes to the compound key, which is
                // already in the list
                let keys = [
                    ScopeKey::circuit_compound(&session.circuit, compound),
                    ScopeKey::compound(compound),
                    ScopeKey::global(),
                ];
                for key in dedup_keys(keys) {
                    let data = scopes.entry(key).or_default();
                    data.degradation.extend_from_slice(&samples);
                    data.penalties.extend_from_slice(&penalties);
                }
            }
            pit_losses.extend(last_stop_losses(&session.pits));
        }

        let mut report = TrainingReport::default();
        let mut keys: Vec<ScopeKey> = scopes.keys().cloned().collect();
        keys.sort_by_key(|k| (k.level(), k.to_string()));

        for key in keys {
            let data = &scopes[&key];

            match DegradationModel::fit(key.clone(), &data.degradation, &self.settings.degradation) {
                Ok(model) => {
                    store.save(model.into_params())?;
                    report.degradation_fitted.push(key.clone());
                }
                Err(e) => skip(&mut report, "degradation", &key, e)?,
            }

            match OutlapModel::fit(key.clone(), &data.penalties, &self.settings.outlap) {
                Ok(model) => {
                    store.save(model.into_params())?;
                    report.outlap_fitted.push(key.clone());
                }
                Err(e) => skip(&mut report, "outlap", &key, e)?,
            }
        }

        match PitLossModel::fit(&pit_losses, &self.settings.pit_loss) {
            Ok(model) => {
                store.save(model.into_params())?;
                report.pit_loss_fitted = true;
            }
            Err(e) => skip(&mut report, "pit loss", &ScopeKey::global(), e)?,
        }

        info!(
            degradation = report.degradation_fitted.len(),
            outlap = report.outlap_fitted.len(),
            pit_loss = report.pit_loss_fitted,
            skipped = report.skipped.len(),
            "training finished"
        );
        Ok(report)
    }
}

fn dedup_keys(keys: [ScopeKey; 3]) -> Vec<ScopeKey> {
    let mut unique: Vec<ScopeKey> = Vec::with_capacity(keys.len());
    for key in keys {
        if !unique.contains(&key) {
            unique.push(key);
        }
    }
    unique
}

/// Data shortfalls are expected and recorded; anything else aborts.
fn skip(report: &mut TrainingReport, model: &str, key: &ScopeKey, err: UndercutError) -> Result<()> {
    match err {
        UndercutError::InsufficientData { .. } | UndercutError::Numerical(_) => {
            warn!(model, scope = %key, error = %err, "skipping scope");
            report.skipped.push((format!("{} {}", model, key), err.to_string()));
            Ok(())
        }
        other => Err(other),
    }
}

/// Measured losses with repeated (competitor, lap) events collapsed to the
/// last one recorded.
fn last_stop_losses(pits: &[PitEvent]) -> Vec<f64> {
    let mut last: BTreeMap<(&str, u32), Option<f64>> = BTreeMap::new();
    for pit in pits {
        last.insert((pit.competitor.as_str(), pit.lap_number), pit.time_loss);
    }
    last.into_values().flatten().collect()
}

fn group_by_compound(stints: &[TireStint]) -> BTreeMap<&str, Vec<&TireStint>> {
    let mut grouped: BTreeMap<&str, Vec<&TireStint>> = BTreeMap::new();
    for stint in stints {
        match stint.compound.as_deref() {
            Some(compound) => grouped.entry(compound).or_default().push(stint),
            None => debug!(competitor = %stint.competitor, start_lap = stint.start_lap, "stint without compound"),
        }
    }
    grouped
}

/// (age, delta) pairs for the given stints. The delta is measured against
/// the competitor's fastest clean lap in the session; neutralized laps and
/// outlaps are left out.
pub fn degradation_samples(aged: &[AgedLap], stints: &[&TireStint]) -> Vec<DegradationSample> {
    let mut baseline: HashMap<&str, f64> = HashMap::new();
    for lap in aged.iter().filter(|l| is_clean(l)) {
        let best = baseline.entry(lap.lap.competitor.as_str()).or_insert(f64::INFINITY);
        *best = best.min(lap.lap.lap_time);
    }

    stints
        .iter()
        .flat_map(|stint| stint.laps.iter())
        .filter(|l| is_clean(l))
        .filter_map(|l| {
            let base = baseline.get(l.lap.competitor.as_str())?;
            Some(DegradationSample {
                tyre_age: l.tyre_age,
                lap_delta: l.lap.lap_time - base,
            })
        })
        .collect()
}

fn is_clean(lap: &AgedLap) -> bool {
    !lap.neutralized && !lap.stint_start
}
