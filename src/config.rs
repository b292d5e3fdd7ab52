use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, UndercutError};
use crate::simulation::SimulationRequest;

/// The root configuration structure for the whole application.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tyre_age: TyreAgeSettings,
    pub degradation: DegradationSettings,
    pub outlap: OutlapSettings,
    pub pit_loss: PitLossSettings,
    pub defaults: DefaultParameters,
    pub store: StoreSettings,
    pub data: DataSettings,
    pub scenario: Option<SimulationRequest>,
}

/// Controls how neutralized laps are recognised.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TyreAgeSettings {
    /// A lap slower than this multiple of the session's typical pace counts
    /// as neutralized even without a track-status code.
    pub neutral_pace_multiplier: f64,
    /// Track-status codes meaning safety car or virtual safety car.
    pub neutral_status_codes: Vec<String>,
}

impl Default for TyreAgeSettings {
    fn default() -> Self {
        Self {
            neutral_pace_multiplier: 1.3,
            neutral_status_codes: ["4", "6", "SC", "VSC"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DegradationSettings {
    pub min_samples: usize,
    /// Cross-validated R² below this marks a fit low-confidence.
    pub min_r_squared: f64,
    pub cv_folds: usize,
    /// Huber tuning constant, in units of the robust residual scale.
    pub huber_k: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for DegradationSettings {
    fn default() -> Self {
        Self {
            min_samples: 5,
            min_r_squared: 0.1,
            cv_folds: 5,
            huber_k: 1.345,
            max_iterations: 50,
            tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutlapSettings {
    pub min_samples: usize,
    pub min_std: f64,
}

impl Default for OutlapSettings {
    fn default() -> Self {
        Self {
            min_samples: 5,
            min_std: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PitLossSettings {
    pub min_samples: usize,
    /// Observations whose robust z-score exceeds this are dropped.
    pub outlier_z: f64,
}

impl Default for PitLossSettings {
    fn default() -> Self {
        Self {
            min_samples: 5,
            outlier_z: 3.0,
        }
    }
}

/// Built-in parameters used when no stored scope qualifies.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultParameters {
    pub degradation_a: f64,
    pub degradation_b: f64,
    pub degradation_c: f64,
    pub degradation_rmse: f64,
    pub outlap_mean: f64,
    pub outlap_std: f64,
    pub pit_loss_mean: f64,
    pub pit_loss_std: f64,
}

impl Default for DefaultParameters {
    fn default() -> Self {
        Self {
            degradation_a: 0.002,
            degradation_b: 0.05,
            degradation_c: 0.0,
            degradation_rmse: 0.3,
            outlap_mean: 1.5,
            outlap_std: 0.5,
            pit_loss_mean: 22.0,
            pit_loss_std: 1.5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// JSON file holding persisted parameter records.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub laps_csv: Option<PathBuf>,
    pub pits_csv: Option<PathBuf>,
    pub circuit: Option<String>,
}

impl Settings {
    /// Loads settings from an optional TOML file, then `UNDERCUT__*`
    /// environment variables, on top of the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or_else(|| Path::new("undercut.toml"));
        let builder = config::Config::builder()
            .add_source(config::File::from(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix("UNDERCUT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let settings = builder.try_deserialize::<Settings>()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tyre_age.neutral_pace_multiplier > 1.0) {
            return Err(UndercutError::invalid(
                "tyre_age.neutral_pace_multiplier",
                format!("must exceed 1.0, got {}", self.tyre_age.neutral_pace_multiplier),
            ));
        }
        if self.degradation.cv_folds < 2 {
            return Err(UndercutError::invalid(
                "degradation.cv_folds",
                format!("need at least 2 folds, got {}", self.degradation.cv_folds),
            ));
        }
        if self.degradation.min_samples < 3 {
            return Err(UndercutError::invalid(
                "degradation.min_samples",
                "a quadratic needs at least 3 samples",
            ));
        }
        if !(self.degradation.huber_k > 0.0) {
            return Err(UndercutError::invalid("degradation.huber_k", "must be positive"));
        }
        if !(self.pit_loss.outlier_z > 0.0) {
            return Err(UndercutError::invalid("pit_loss.outlier_z", "must be positive"));
        }
        if self.outlap.min_samples < 2 || self.pit_loss.min_samples < 2 {
            return Err(UndercutError::invalid(
                "min_samples",
                "a standard deviation needs at least 2 samples",
            ));
        }
        let d = &self.defaults;
        if !(d.outlap_std > 0.0 && d.pit_loss_std > 0.0 && d.degradation_rmse >= 0.0) {
            return Err(UndercutError::invalid(
                "defaults",
                "default spreads must be positive",
            ));
        }
        Ok(())
    }
}
