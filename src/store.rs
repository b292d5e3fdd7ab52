//! Persisted model parameters and the scope fallback walk.
//!
//! Records live behind `RwLock<HashMap<ScopeKey, Arc<_>>>`: a save swaps in a
//! whole new `Arc`, so a reader holding the old one keeps a complete record
//! and never sees a half-written one.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::{Result, UndercutError};
use crate::params::{
    DegradationParameters, ModelType, OutlapParameters, ParameterRecord, Parameters,
    PitLossParameters,
};
use crate::scope::{ScopeKey, ScopeLevel};

/// Minimum evidence a stored record must carry to be used.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionCriteria {
    pub degradation_min_samples: usize,
    pub degradation_min_r_squared: f64,
    pub outlap_min_samples: usize,
    pub pit_loss_min_samples: usize,
}

impl SelectionCriteria {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            degradation_min_samples: settings.degradation.min_samples,
            degradation_min_r_squared: settings.degradation.min_r_squared,
            outlap_min_samples: settings.outlap.min_samples,
            pit_loss_min_samples: settings.pit_loss.min_samples,
        }
    }
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone, Default)]
struct Builtins {
    degradation: Option<Arc<DegradationParameters>>,
    outlap: Option<Arc<OutlapParameters>>,
    pit_loss: Option<Arc<PitLossParameters>>,
}

/// Parameters chosen for a request, with the level they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub params: Arc<T>,
    pub level: ScopeLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub degradation_scopes: usize,
    pub outlap_scopes: usize,
    pub has_pit_loss: bool,
    pub low_confidence_degradation: usize,
}

#[derive(Debug)]
pub struct ParameterStore {
    path: Option<PathBuf>,
    criteria: SelectionCriteria,
    builtins: Builtins,
    degradation: RwLock<HashMap<ScopeKey, Arc<DegradationParameters>>>,
    outlap: RwLock<HashMap<ScopeKey, Arc<OutlapParameters>>>,
    pit_loss: RwLock<Option<Arc<PitLossParameters>>>,
    // serialises file rewrites
    write_lock: Mutex<()>,
}

impl ParameterStore {
    /// In-memory store with the built-in defaults from `settings`.
    pub fn new(settings: &Settings) -> Self {
        let defaults = &settings.defaults;
        Self {
            path: None,
            criteria: SelectionCriteria::from_settings(settings),
            builtins: Builtins {
                degradation: Some(Arc::new(DegradationParameters::builtin(defaults))),
                outlap: Some(Arc::new(OutlapParameters::builtin(defaults))),
                pit_loss: Some(Arc::new(PitLossParameters::builtin(defaults))),
            },
            degradation: RwLock::new(HashMap::new()),
            outlap: RwLock::new(HashMap::new()),
            pit_loss: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// A store with no built-in defaults. Resolution fails with
    /// `MissingScopeDefault` once every stored scope is exhausted.
    pub fn without_defaults(criteria: SelectionCriteria) -> Self {
        Self {
            path: None,
            criteria,
            builtins: Builtins::default(),
            degradation: RwLock::new(HashMap::new()),
            outlap: RwLock::new(HashMap::new()),
            pit_loss: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Opens a file-backed store, loading any records already on disk.
    pub fn open<P: AsRef<Path>>(path: P, settings: &Settings) -> Result<Self> {
        let mut store = Self::new(settings);
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            let text = fs::read_to_string(&path)?;
            let records: Vec<ParameterRecord> = serde_json::from_str(&text)?;
            let count = records.len();
            for record in records {
                let parameters = Parameters::try_from(record)?;
                check_scope(&parameters)?;
                store.insert(parameters);
            }
            info!(path = %path.display(), records = count, "loaded parameter store");
        } else {
            debug!(path = %path.display(), "parameter file not found; starting empty");
        }

        store.path = Some(path);
        Ok(store)
    }

    /// Stores `parameters` under their own scope, replacing any previous
    /// record for the same (model type, scope).
    ///
    /// With a backing file the file is rewritten first; if that fails the
    /// store is left as it was.
    pub fn save(&self, parameters: impl Into<Parameters>) -> Result<()> {
        let parameters = parameters.into();
        check_scope(&parameters)?;
        let _guard = self.write_lock.lock();

        if let Some(path) = &self.path {
            let record = ParameterRecord::from(&parameters);
            let mut records: Vec<ParameterRecord> = self
                .records()
                .into_iter()
                .filter(|r| r.model_type != record.model_type || r.scope_key != record.scope_key)
                .collect();
            records.push(record);
            sort_records(&mut records);

            let json = serde_json::to_string_pretty(&records)?;
            atomic_write(path, json.as_bytes())?;
            debug!(path = %path.display(), records = records.len(), "persisted parameter store");
        }

        self.insert(parameters);
        Ok(())
    }

    fn insert(&self, parameters: Parameters) {
        match parameters {
            Parameters::Degradation(p) => {
                debug!(scope = %p.scope, "storing degradation parameters");
                self.degradation.write().insert(p.scope.clone(), Arc::new(p));
            }
            Parameters::Outlap(p) => {
                debug!(scope = %p.scope, "storing outlap parameters");
                self.outlap.write().insert(p.scope.clone(), Arc::new(p));
            }
            Parameters::PitLoss(p) => {
                debug!("storing pit loss parameters");
                *self.pit_loss.write() = Some(Arc::new(p));
            }
        }
    }

    pub fn records(&self) -> Vec<ParameterRecord> {
        let mut records: Vec<ParameterRecord> = Vec::new();
        records.extend(
            self.degradation
                .read()
                .values()
                .map(|p| ParameterRecord::from(&Parameters::Degradation((**p).clone()))),
        );
        records.extend(
            self.outlap
                .read()
                .values()
                .map(|p| ParameterRecord::from(&Parameters::Outlap((**p).clone()))),
        );
        if let Some(p) = self.pit_loss.read().as_ref() {
            records.push(ParameterRecord::from(&Parameters::PitLoss((**p).clone())));
        }
        sort_records(&mut records);
        records
    }

    pub fn get_degradation_params(
        &self,
        circuit: Option<&str>,
        compound: Option<&str>,
    ) -> Result<Resolved<DegradationParameters>> {
        let key = ScopeKey::new(circuit, compound);
        let stored = self.degradation.read();
        for scope in key.fallback_chain() {
            let Some(params) = stored.get(&scope) else {
                continue;
            };
            match self.check_degradation(params) {
                Ok(()) => {
                    debug!(requested = %key, used = %scope, "resolved degradation parameters");
                    return Ok(Resolved {
                        params: Arc::clone(params),
                        level: scope.level(),
                    });
                }
                Err(reason) => debug!(scope = %scope, %reason, "skipping degradation scope"),
            }
        }
        drop(stored);

        match &self.builtins.degradation {
            Some(params) if params.is_finite() => {
                debug!(requested = %key, "using built-in degradation default");
                Ok(Resolved {
                    params: Arc::clone(params),
                    level: ScopeLevel::Default,
                })
            }
            _ => Err(UndercutError::MissingScopeDefault { model: "degradation" }),
        }
    }

    pub fn get_outlap_params(
        &self,
        circuit: Option<&str>,
        compound: Option<&str>,
    ) -> Result<Resolved<OutlapParameters>> {
        let key = ScopeKey::new(circuit, compound);
        let stored = self.outlap.read();
        for scope in key.fallback_chain() {
            let Some(params) = stored.get(&scope) else {
                continue;
            };
            if params.sample_count >= self.criteria.outlap_min_samples && params.is_finite() {
                debug!(requested = %key, used = %scope, "resolved outlap parameters");
                return Ok(Resolved {
                    params: Arc::clone(params),
                    level: scope.level(),
                });
            }
            debug!(scope = %scope, n = params.sample_count, "skipping outlap scope");
        }
        drop(stored);

        match &self.builtins.outlap {
            Some(params) if params.is_finite() => Ok(Resolved {
                params: Arc::clone(params),
                level: ScopeLevel::Default,
            }),
            _ => Err(UndercutError::MissingScopeDefault { model: "outlap" }),
        }
    }

    pub fn get_pit_loss_params(&self) -> Result<Resolved<PitLossParameters>> {
        if let Some(params) = self.pit_loss.read().as_ref() {
            if params.sample_count >= self.criteria.pit_loss_min_samples && params.is_finite() {
                return Ok(Resolved {
                    params: Arc::clone(params),
                    level: ScopeLevel::Global,
                });
            }
        }
        match &self.builtins.pit_loss {
            Some(params) if params.is_finite() => Ok(Resolved {
                params: Arc::clone(params),
                level: ScopeLevel::Default,
            }),
            _ => Err(UndercutError::MissingScopeDefault { model: "pit loss" }),
        }
    }

    fn check_degradation(&self, params: &DegradationParameters) -> Result<()> {
        if params.sample_count < self.criteria.degradation_min_samples {
            return Err(UndercutError::InsufficientData {
                scope: params.scope.clone(),
                required: self.criteria.degradation_min_samples,
                found: params.sample_count,
            });
        }
        if params.low_confidence || params.r_squared < self.criteria.degradation_min_r_squared {
            return Err(UndercutError::LowQualityFit {
                scope: params.scope.clone(),
                r_squared: params.r_squared,
                threshold: self.criteria.degradation_min_r_squared,
            });
        }
        if !params.is_finite() {
            return Err(UndercutError::Numerical(format!(
                "non-finite coefficients at {}",
                params.scope
            )));
        }
        Ok(())
    }

    pub fn summary(&self) -> StoreSummary {
        let degradation = self.degradation.read();
        StoreSummary {
            degradation_scopes: degradation.len(),
            outlap_scopes: self.outlap.read().len(),
            has_pit_loss: self.pit_loss.read().is_some(),
            low_confidence_degradation: degradation.values().filter(|p| p.low_confidence).count(),
        }
    }
}

/// A circuit without a compound has no place in the fallback walk, so a
/// record keyed that way could never be resolved.
fn check_scope(parameters: &Parameters) -> Result<()> {
    let scope = match parameters {
        Parameters::Degradation(p) => &p.scope,
        Parameters::Outlap(p) => &p.scope,
        Parameters::PitLoss(_) => return Ok(()),
    };
    if scope.circuit.is_some() && scope.compound.is_none() {
        return Err(UndercutError::invalid(
            "scope",
            format!("{} names a circuit without a compound", scope),
        ));
    }
    Ok(())
}

fn sort_records(records: &mut [ParameterRecord]) {
    records.sort_by(|a, b| {
        (model_rank(a.model_type), a.scope_key.to_string())
            .cmp(&(model_rank(b.model_type), b.scope_key.to_string()))
    });
}

fn model_rank(model: ModelType) -> u8 {
    match model {
        ModelType::Degradation => 0,
        ModelType::Outlap => 1,
        ModelType::PitLoss => 2,
    }
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)?;
    Ok(())
}
