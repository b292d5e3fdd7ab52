use chrono::Utc;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use statrs::distribution::{ContinuousCDF, Normal as NormalCdf};
use tracing::{info, warn};

use crate::config::PitLossSettings;
use crate::error::{Result, UndercutError};
use crate::params::PitLossParameters;
use crate::scope::ScopeKey;
use crate::stats;

/// Scales a MAD-based deviation to be comparable with a normal z-score.
const ROBUST_Z_SCALE: f64 = 0.6745;

/// Normal(mean, std) total time lost to a pit stop.
#[derive(Debug, Clone)]
pub struct PitLossModel {
    params: PitLossParameters,
    sampler: Normal<f64>,
    cdf: NormalCdf,
}

impl PitLossModel {
    pub fn from_parameters(params: PitLossParameters) -> Result<Self> {
        let sampler = Normal::new(params.mean, params.std)
            .map_err(|e| UndercutError::invalid("pit_loss.std", e.to_string()))?;
        let cdf = NormalCdf::new(params.mean, params.std)
            .map_err(|e| UndercutError::invalid("pit_loss.std", e.to_string()))?;
        Ok(Self { params, sampler, cdf })
    }

    /// Fits a normal to observed losses after dropping outliers by robust
    /// (median/MAD) z-score.
    pub fn fit(samples: &[f64], settings: &PitLossSettings) -> Result<Self> {
        let finite: Vec<f64> = samples.iter().copied().filter(|s| s.is_finite()).collect();
        let insufficient = |found: usize| UndercutError::InsufficientData {
            scope: ScopeKey::global(),
            required: settings.min_samples,
            found,
        };
        if finite.len() < settings.min_samples {
            return Err(insufficient(finite.len()));
        }

        let kept = drop_outliers(&finite, settings.outlier_z);
        if kept.len() < finite.len() {
            warn!(
                dropped = finite.len() - kept.len(),
                threshold = settings.outlier_z,
                "excluded outlying pit losses"
            );
        }
        if kept.len() < settings.min_samples {
            return Err(insufficient(kept.len()));
        }

        let mean = stats::mean(&kept).unwrap_or(0.0);
        let std = stats::sample_std(&kept).unwrap_or(0.0);
        if !(std > 0.0) {
            return Err(UndercutError::Numerical(
                "pit losses have zero spread".to_string(),
            ));
        }
        info!(mean, std, n = kept.len(), "fitted pit loss");

        Self::from_parameters(PitLossParameters {
            mean,
            std,
            sample_count: kept.len(),
            fitted_at: Utc::now(),
        })
    }

    pub fn params(&self) -> &PitLossParameters {
        &self.params
    }

    pub fn into_params(self) -> PitLossParameters {
        self.params
    }

    pub fn sample_one<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.sampler.sample(rng)
    }

    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<f64> {
        (0..n).map(|_| self.sample_one(rng)).collect()
    }

    /// Probability that a stop loses less than `seconds`.
    pub fn probability_faster_than(&self, seconds: f64) -> f64 {
        self.cdf.cdf(seconds)
    }

    /// Loss at percentile `p` in (0, 100).
    pub fn percentile(&self, p: f64) -> Option<f64> {
        (p > 0.0 && p < 100.0).then(|| self.cdf.inverse_cdf(p / 100.0))
    }
}

fn drop_outliers(values: &[f64], z_limit: f64) -> Vec<f64> {
    let (Some(median), Some(mad)) = (stats::median(values), stats::mad(values)) else {
        return values.to_vec();
    };
    if mad <= f64::EPSILON {
        return values.to_vec();
    }
    values
        .iter()
        .copied()
        .filter(|v| (ROBUST_Z_SCALE * (v - median) / mad).abs() <= z_limit)
        .collect()
}
