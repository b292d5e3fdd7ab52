use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DefaultParameters;
use crate::error::{Result, UndercutError};
use crate::scope::ScopeKey;

/// Fitted quadratic `delta = a·age² + b·age + c` for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationParameters {
    pub scope: ScopeKey,
    pub a: f64,
    pub b: f64,
    pub c: f64,
    /// Cross-validated R².
    pub r_squared: f64,
    /// Cross-validated RMSE, also the residual spread used when sampling.
    pub rmse: f64,
    pub sample_count: usize,
    pub fitted_at: DateTime<Utc>,
    pub low_confidence: bool,
}

impl DegradationParameters {
    pub fn builtin(defaults: &DefaultParameters) -> Self {
        Self {
            scope: ScopeKey::global(),
            a: defaults.degradation_a,
            b: defaults.degradation_b,
            c: defaults.degradation_c,
            r_squared: 1.0,
            rmse: defaults.degradation_rmse,
            sample_count: 0,
            fitted_at: DateTime::<Utc>::UNIX_EPOCH,
            low_confidence: false,
        }
    }

    pub fn is_finite(&self) -> bool {
        [self.a, self.b, self.c, self.rmse].iter().all(|v| v.is_finite()) && self.rmse >= 0.0
    }
}

/// Normal(mean, std) cold-tyre penalty for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlapParameters {
    pub scope: ScopeKey,
    pub mean: f64,
    pub std: f64,
    pub sample_count: usize,
    pub fitted_at: DateTime<Utc>,
}

impl OutlapParameters {
    pub fn builtin(defaults: &DefaultParameters) -> Self {
        Self {
            scope: ScopeKey::global(),
            mean: defaults.outlap_mean,
            std: defaults.outlap_std,
            sample_count: 0,
            fitted_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.mean.is_finite() && self.std.is_finite() && self.std > 0.0
    }
}

/// Normal(mean, std) pit-stop time loss. Not scoped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitLossParameters {
    pub mean: f64,
    pub std: f64,
    pub sample_count: usize,
    pub fitted_at: DateTime<Utc>,
}

impl PitLossParameters {
    pub fn builtin(defaults: &DefaultParameters) -> Self {
        Self {
            mean: defaults.pit_loss_mean,
            std: defaults.pit_loss_std,
            sample_count: 0,
            fitted_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.mean.is_finite() && self.std.is_finite() && self.std > 0.0
    }
}

/// Any fitted parameter set, as handed to `ParameterStore::save`.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameters {
    Degradation(DegradationParameters),
    Outlap(OutlapParameters),
    PitLoss(PitLossParameters),
}

impl From<DegradationParameters> for Parameters {
    fn from(p: DegradationParameters) -> Self {
        Parameters::Degradation(p)
    }
}

impl From<OutlapParameters> for Parameters {
    fn from(p: OutlapParameters) -> Self {
        Parameters::Outlap(p)
    }
}

impl From<PitLossParameters> for Parameters {
    fn from(p: PitLossParameters) -> Self {
        Parameters::PitLoss(p)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Degradation,
    Outlap,
    PitLoss,
}

/// On-disk shape of one parameter set; one record per (model type, scope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub scope_key: ScopeKey,
    pub model_type: ModelType,
    /// `[a, b, c, rmse]` for degradation, `[mean, std]` otherwise.
    pub coefficients_or_moments: Vec<f64>,
    pub sample_count: usize,
    pub quality_score: Option<f64>,
    pub fitted_at: DateTime<Utc>,
    #[serde(default)]
    pub low_confidence: bool,
}

impl From<&Parameters> for ParameterRecord {
    fn from(params: &Parameters) -> Self {
        match params {
            Parameters::Degradation(p) => ParameterRecord {
                scope_key: p.scope.clone(),
                model_type: ModelType::Degradation,
                coefficients_or_moments: vec![p.a, p.b, p.c, p.rmse],
                sample_count: p.sample_count,
                quality_score: Some(p.r_squared),
                fitted_at: p.fitted_at,
                low_confidence: p.low_confidence,
            },
            Parameters::Outlap(p) => ParameterRecord {
                scope_key: p.scope.clone(),
                model_type: ModelType::Outlap,
                coefficients_or_moments: vec![p.mean, p.std],
                sample_count: p.sample_count,
                quality_score: None,
                fitted_at: p.fitted_at,
                low_confidence: false,
            },
            Parameters::PitLoss(p) => ParameterRecord {
                scope_key: ScopeKey::global(),
                model_type: ModelType::PitLoss,
                coefficients_or_moments: vec![p.mean, p.std],
                sample_count: p.sample_count,
                quality_score: None,
                fitted_at: p.fitted_at,
                low_confidence: false,
            },
        }
    }
}

impl TryFrom<ParameterRecord> for Parameters {
    type Error = UndercutError;

    fn try_from(record: ParameterRecord) -> Result<Self> {
        let values = &record.coefficients_or_moments;
        let expected = match record.model_type {
            ModelType::Degradation => 4,
            ModelType::Outlap | ModelType::PitLoss => 2,
        };
        if values.len() != expected {
            return Err(UndercutError::invalid(
                "coefficients_or_moments",
                format!(
                    "{:?} record for {} has {} values, expected {}",
                    record.model_type,
                    record.scope_key,
                    values.len(),
                    expected
                ),
            ));
        }

        Ok(match record.model_type {
            ModelType::Degradation => Parameters::Degradation(DegradationParameters {
                scope: record.scope_key,
                a: values[0],
                b: values[1],
                c: values[2],
                rmse: values[3],
                r_squared: record.quality_score.unwrap_or(0.0),
                sample_count: record.sample_count,
                fitted_at: record.fitted_at,
                low_confidence: record.low_confidence,
            }),
            ModelType::Outlap => Parameters::Outlap(OutlapParameters {
                scope: record.scope_key,
                mean: values[0],
                std: values[1],
                sample_count: record.sample_count,
                fitted_at: record.fitted_at,
            }),
            ModelType::PitLoss => Parameters::PitLoss(PitLossParameters {
                mean: values[0],
                std: values[1],
                sample_count: record.sample_count,
                fitted_at: record.fitted_at,
            }),
        })
    }
}
