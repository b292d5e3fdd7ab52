use thiserror::Error;

use crate::scope::ScopeKey;

#[derive(Error, Debug)]
pub enum UndercutError {
    #[error("Insufficient data at scope {scope}: need {required} samples, found {found}")]
    InsufficientData {
        scope: ScopeKey,
        required: usize,
        found: usize,
    },

    #[error("Low quality fit at scope {scope}: R² {r_squared:.3} below threshold {threshold:.3}")]
    LowQualityFit {
        scope: ScopeKey,
        r_squared: f64,
        threshold: f64,
    },

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("No usable {model} parameters at any scope, including the built-in default")]
    MissingScopeDefault { model: &'static str },

    #[error("Numerical failure: {0}")]
    Numerical(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, UndercutError>;

impl UndercutError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        UndercutError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}
