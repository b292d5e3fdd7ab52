use chrono::Utc;
use linfa::prelude::*;
use linfa_linear::LinearRegression;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array1, Array2};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::config::DegradationSettings;
use crate::error::{Result, UndercutError};
use crate::params::DegradationParameters;
use crate::scope::ScopeKey;
use crate::stats;

/// MAD of a standard normal sample; turns a MAD into a sigma estimate.
const MAD_TO_SIGMA: f64 = 0.6745;

/// One training point: tyre age and lap-time loss against the competitor's
/// clean-lap baseline. Neutralized laps must already be excluded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegradationSample {
    pub tyre_age: u32,
    pub lap_delta: f64,
}

/// Lap-time loss as a quadratic in tyre age:
/// `delta = a·age² + b·age + c`.
#[derive(Debug, Clone, PartialEq)]
pub struct DegradationModel {
    params: DegradationParameters,
}

impl DegradationModel {
    pub fn from_parameters(params: DegradationParameters) -> Self {
        Self { params }
    }

    /// Fits the curve with Huber-weighted IRLS and scores it by k-fold CV.
    ///
    /// A fit whose cross-validated R² falls below `min_r_squared` is still
    /// returned, flagged `low_confidence`.
    pub fn fit(
        scope: ScopeKey,
        samples: &[DegradationSample],
        settings: &DegradationSettings,
    ) -> Result<Self> {
        let (ages, deltas): (Vec<f64>, Vec<f64>) = samples
            .iter()
            .filter(|s| s.lap_delta.is_finite())
            .map(|s| (s.tyre_age as f64, s.lap_delta))
            .unzip();

        if ages.len() < settings.min_samples {
            return Err(UndercutError::InsufficientData {
                scope,
                required: settings.min_samples,
                found: ages.len(),
            });
        }
        // three coefficients need three distinct ages
        let distinct = distinct_ages(&ages);
        if distinct < 3 {
            return Err(UndercutError::InsufficientData {
                scope,
                required: 3,
                found: distinct,
            });
        }

        let [a, b, c] = robust_fit(&ages, &deltas, settings)?;
        let (r_squared, rmse) = cross_validate(&ages, &deltas, settings);
        let low_confidence = r_squared < settings.min_r_squared;

        if low_confidence {
            warn!(
                scope = %scope,
                r_squared,
                threshold = settings.min_r_squared,
                "low quality degradation fit; broader scopes will be preferred"
            );
        } else {
            info!(scope = %scope, a, b, c, r_squared, rmse, n = ages.len(), "fitted degradation");
        }

        Ok(Self {
            params: DegradationParameters {
                scope,
                a,
                b,
                c,
                r_squared,
                rmse,
                sample_count: ages.len(),
                fitted_at: Utc::now(),
                low_confidence,
            },
        })
    }

    pub fn params(&self) -> &DegradationParameters {
        &self.params
    }

    pub fn into_params(self) -> DegradationParameters {
        self.params
    }

    /// Predicted lap-time loss in seconds at the given tyre age.
    pub fn predict(&self, age: f64) -> f64 {
        let p = &self.params;
        p.a * age * age + p.b * age + p.c
    }

    /// Seconds per lap gained by running `new_age` tyres instead of `old_age`.
    pub fn fresh_tire_advantage(&self, old_age: f64, new_age: f64) -> f64 {
        self.predict(old_age) - self.predict(new_age)
    }

    /// Residual spread to add around the mean curve when sampling laps.
    pub fn residual_std(&self) -> f64 {
        self.params.rmse
    }

    /// Whether the curve rises across `[lo, hi]`. The vertex of the parabola
    /// is the only place the slope can change sign.
    pub fn is_increasing_over(&self, lo: f64, hi: f64) -> bool {
        let slope = |age: f64| 2.0 * self.params.a * age + self.params.b;
        slope(lo) > 0.0 && slope(hi) > 0.0
    }
}

fn distinct_ages(ages: &[f64]) -> usize {
    ages.iter().map(|a| a.to_bits()).collect::<BTreeSet<_>>().len()
}

/// Ordinary least squares on `[age, age²]`, used as the IRLS starting point.
fn ols_start(ages: &[f64], deltas: &[f64]) -> Result<[f64; 3]> {
    let feats: Vec<f64> = ages.iter().flat_map(|&age| [age, age * age]).collect();
    let x = Array2::from_shape_vec((ages.len(), 2), feats)
        .map_err(|e| UndercutError::Numerical(e.to_string()))?;
    let y = Array1::from_vec(deltas.to_vec());
    let ds = Dataset::new(x, y);

    let fitted = LinearRegression::new()
        .fit(&ds)
        .map_err(|e| UndercutError::Numerical(e.to_string()))?;
    let params = fitted.params();
    Ok([params[1], params[0], fitted.intercept()])
}

fn weighted_solve(ages: &[f64], deltas: &[f64], weights: &[f64]) -> Option<[f64; 3]> {
    let mut xtwx = Matrix3::<f64>::zeros();
    let mut xtwy = Vector3::<f64>::zeros();
    for ((&age, &y), &w) in ages.iter().zip(deltas).zip(weights) {
        let row = Vector3::new(age * age, age, 1.0);
        xtwx += row * row.transpose() * w;
        xtwy += row * (w * y);
    }
    let beta = xtwx.cholesky()?.solve(&xtwy);
    Some([beta[0], beta[1], beta[2]])
}

fn eval(beta: &[f64; 3], age: f64) -> f64 {
    beta[0] * age * age + beta[1] * age + beta[2]
}

/// Iteratively reweighted least squares under Huber loss. Residuals beyond
/// `huber_k` robust sigmas get weight `k/|u|`, so a single incident lap
/// cannot drag the curve.
fn robust_fit(ages: &[f64], deltas: &[f64], settings: &DegradationSettings) -> Result<[f64; 3]> {
    let mut beta = ols_start(ages, deltas)?;

    for iteration in 0..settings.max_iterations {
        let residuals: Vec<f64> = ages
            .iter()
            .zip(deltas)
            .map(|(&age, &y)| y - eval(&beta, age))
            .collect();

        let mut scale = stats::mad(&residuals).unwrap_or(0.0) / MAD_TO_SIGMA;
        if scale <= f64::EPSILON {
            let abs: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
            scale = stats::mean(&abs).unwrap_or(0.0);
        }
        if scale <= f64::EPSILON {
            // the curve already passes through every point
            break;
        }

        let weights: Vec<f64> = residuals
            .iter()
            .map(|r| {
                let u = (r / scale).abs();
                if u <= settings.huber_k {
                    1.0
                } else {
                    settings.huber_k / u
                }
            })
            .collect();

        let next = weighted_solve(ages, deltas, &weights).ok_or_else(|| {
            UndercutError::Numerical("weighted normal equations are singular".to_string())
        })?;
        let change = next
            .iter()
            .zip(&beta)
            .map(|(n, o)| (n - o).abs())
            .fold(0.0, f64::max);
        beta = next;
        if change < settings.tolerance {
            debug!(iteration, "huber regression converged");
            break;
        }
    }

    if beta.iter().all(|v| v.is_finite()) {
        Ok(beta)
    } else {
        Err(UndercutError::Numerical("non-finite degradation coefficients".to_string()))
    }
}

/// Pooled out-of-fold R² and RMSE over interleaved folds.
fn cross_validate(ages: &[f64], deltas: &[f64], settings: &DegradationSettings) -> (f64, f64) {
    let n = ages.len();
    let k = settings.cv_folds.clamp(2, n);
    let mut observed = Vec::with_capacity(n);
    let mut ss_res = 0.0;

    for fold in 0..k {
        let (mut train_x, mut train_y) = (Vec::new(), Vec::new());
        let mut test = Vec::new();
        for i in 0..n {
            if i % k == fold {
                test.push(i);
            } else {
                train_x.push(ages[i]);
                train_y.push(deltas[i]);
            }
        }

        if distinct_ages(&train_x) < 3 {
            debug!(fold, "skipping fold with fewer than three distinct ages");
            continue;
        }
        let beta = match robust_fit(&train_x, &train_y, settings) {
            Ok(beta) => beta,
            Err(e) => {
                debug!(fold, error = %e, "cross-validation fold failed");
                continue;
            }
        };
        for i in test {
            ss_res += (deltas[i] - eval(&beta, ages[i])).powi(2);
            observed.push(deltas[i]);
        }
    }

    let Some(mean) = stats::mean(&observed) else {
        return (0.0, 0.0);
    };
    let ss_tot: f64 = observed.iter().map(|y| (y - mean).powi(2)).sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };
    let rmse = (ss_res / observed.len() as f64).sqrt();
    (r_squared, rmse)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve_samples(a: f64, b: f64, c: f64, ages: std::ops::RangeInclusive<u32>) -> Vec<DegradationSample> {
        ages.map(|age| {
            let x = age as f64;
            // deterministic wobble so the fit is not exact
            let noise = if age % 2 == 0 { 0.02 } else { -0.02 };
            DegradationSample {
                tyre_age: age,
                lap_delta: a * x * x + b * x + c + noise,
            }
        })
        .collect()
    }

    #[test]
    fn recovers_clean_quadratic() {
        let samples = curve_samples(0.004, 0.05, 0.1, 1..=25);
        let model = DegradationModel::fit(
            ScopeKey::circuit_compound("bahrain", "SOFT"),
            &samples,
            &DegradationSettings::default(),
        )
        .unwrap();

        let p = model.params();
        assert!((p.a - 0.004).abs() < 1e-3, "a = {}", p.a);
        assert!((p.b - 0.05).abs() < 2e-2, "b = {}", p.b);
        assert!(p.r_squared > 0.9);
        assert!(!p.low_confidence);
        assert_eq!(p.sample_count, 25);
    }

    #[test]
    fn resists_outlier_laps() {
        let mut samples = curve_samples(0.0, 0.1, 0.0, 1..=20);
        samples[9].lap_delta += 8.0;
        samples[14].lap_delta += 12.0;

        let settings = DegradationSettings::default();
        let robust = DegradationModel::fit(ScopeKey::global(), &samples, &settings).unwrap();
        let ages: Vec<f64> = samples.iter().map(|s| s.tyre_age as f64).collect();
        let deltas: Vec<f64> = samples.iter().map(|s| s.lap_delta).collect();
        let ols = ols_start(&ages, &deltas).unwrap();

        let truth = 0.1 * 18.0;
        let robust_err = (robust.predict(18.0) - truth).abs();
        let ols_err = (eval(&ols, 18.0) - truth).abs();
        assert!(robust_err < ols_err, "robust {} vs ols {}", robust_err, ols_err);
        assert!(robust_err < 0.3);
    }

    #[test]
    fn too_few_samples_is_insufficient_data() {
        let samples = curve_samples(0.0, 0.1, 0.0, 1..=4);
        let err = DegradationModel::fit(ScopeKey::compound("HARD"), &samples, &DegradationSettings::default())
            .unwrap_err();
        assert!(matches!(err, UndercutError::InsufficientData { required: 5, found: 4, .. }));
    }

    #[test]
    fn repeated_age_is_insufficient_data() {
        let samples: Vec<_> = (0..10)
            .map(|i| DegradationSample {
                tyre_age: 3 + (i % 2),
                lap_delta: 0.2,
            })
            .collect();
        let err = DegradationModel::fit(ScopeKey::global(), &samples, &DegradationSettings::default())
            .unwrap_err();
        assert!(matches!(err, UndercutError::InsufficientData { required: 3, found: 2, .. }));
    }

    #[test]
    fn flat_noise_is_low_confidence() {
        let samples: Vec<_> = (1..=20)
            .map(|age| DegradationSample {
                tyre_age: age,
                lap_delta: if age % 3 == 0 { 0.4 } else { -0.2 },
            })
            .collect();
        let model = DegradationModel::fit(ScopeKey::global(), &samples, &DegradationSettings::default())
            .unwrap();
        assert!(model.params().low_confidence);
    }

    #[test]
    fn fresh_tires_are_faster_on_rising_curve() {
        let model = DegradationModel::fit(
            ScopeKey::compound("MEDIUM"),
            &curve_samples(0.003, 0.06, 0.0, 1..=20),
            &DegradationSettings::default(),
        )
        .unwrap();
        assert!(model.is_increasing_over(1.0, 20.0));
        assert!(model.fresh_tire_advantage(15.0, 2.0) > 0.0);
        assert_eq!(model.fresh_tire_advantage(7.0, 7.0), 0.0);
    }
}
