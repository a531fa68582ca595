//! # Regressors and Model Artifacts
//!
//! Linear estimators over standardized features. The point estimator is a
//! ridge fit; the quantile estimators minimise the pinball loss with the same
//! ridge penalty through iteratively reweighted least squares. Both are
//! persisted as human-readable TOML and validated against the canonical
//! feature order on load.

use crate::features::FEATURE_NAMES;
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Residual magnitudes below this are treated as this value when reweighting.
const IRLS_RESIDUAL_FLOOR: f64 = 1e-6;
/// Standard deviations below this mark a constant column, which is left unscaled.
const MIN_FEATURE_SCALE: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Solving the penalized normal equations failed: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
    #[error(
        "Model was trained on features {found:?}, but this build scores features {expected:?}."
    )]
    FeatureMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("Training data has {rows} rows and {targets} targets; they must match and be non-empty.")]
    InvalidTrainingShape { rows: usize, targets: usize },
    #[error("Model stores {found} coefficients for {expected} features.")]
    CorruptArtifact { expected: usize, found: usize },
}

/// The scoring capability shared by every estimator.
pub trait Regressor {
    /// Number of input columns the estimator expects.
    fn n_features(&self) -> usize;

    /// Raw (unclamped, unrounded) prediction for one feature row.
    fn predict(&self, row: ArrayView1<f64>) -> f64;
}

/// A linear function of standardized features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub feature_names: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl Regressor for LinearModel {
    fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        row.iter()
            .zip(&self.means)
            .zip(&self.scales)
            .zip(&self.coefficients)
            .fold(self.intercept, |acc, (((x, mean), scale), beta)| {
                acc + beta * (x - mean) / scale
            })
    }
}

impl LinearModel {
    /// Fits a ridge regression. The intercept is not penalized.
    pub fn fit_ridge(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        alpha: f64,
    ) -> Result<Self, ModelError> {
        let standardized = Standardized::new(x, y)?;
        let weights = Array1::ones(y.len());
        let (intercept, coefficients) = standardized.solve(y, weights.view(), alpha)?;
        Ok(standardized.into_model(intercept, coefficients))
    }

    /// Fits a linear quantile regression for quantile `tau` in (0, 1).
    ///
    /// Starts from the ridge solution and reweights each residual by
    /// `tau / |r|` (above the fit) or `(1 - tau) / |r|` (below) until the
    /// largest coefficient change drops below `tolerance`.
    pub fn fit_quantile(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        tau: f64,
        alpha: f64,
        max_iterations: usize,
        tolerance: f64,
    ) -> Result<Self, ModelError> {
        let standardized = Standardized::new(x, y)?;
        let mut weights = Array1::<f64>::ones(y.len());
        let (mut intercept, mut coefficients) = standardized.solve(y, weights.view(), alpha)?;

        let mut converged = false;
        for iteration in 0..max_iterations {
            let fitted = standardized.z.dot(&coefficients) + intercept;
            for ((w, &observed), &prediction) in weights.iter_mut().zip(y).zip(&fitted) {
                let residual = observed - prediction;
                let side = if residual >= 0.0 { tau } else { 1.0 - tau };
                *w = side / (2.0 * residual.abs().max(IRLS_RESIDUAL_FLOOR));
            }
            let (next_intercept, next_coefficients) =
                standardized.solve(y, weights.view(), alpha)?;

            let change = next_coefficients
                .iter()
                .zip(&coefficients)
                .map(|(a, b)| (a - b).abs())
                .fold((next_intercept - intercept).abs(), f64::max);
            intercept = next_intercept;
            coefficients = next_coefficients;
            if change < tolerance {
                debug!("Quantile {tau} fit converged after {} iterations", iteration + 1);
                converged = true;
                break;
            }
        }
        if !converged {
            warn!(
                "Quantile {tau} fit did not converge within {max_iterations} iterations; keeping the last iterate"
            );
        }
        Ok(standardized.into_model(intercept, coefficients))
    }

    fn check_features(&self) -> Result<(), ModelError> {
        let expected: Vec<String> = FEATURE_NAMES.iter().map(|n| n.to_string()).collect();
        if self.feature_names != expected {
            return Err(ModelError::FeatureMismatch {
                expected,
                found: self.feature_names.clone(),
            });
        }
        for len in [self.means.len(), self.scales.len(), self.coefficients.len()] {
            if len != expected.len() {
                return Err(ModelError::CorruptArtifact {
                    expected: expected.len(),
                    found: len,
                });
            }
        }
        Ok(())
    }
}

/// Column-standardized design matrix with the statistics needed to undo it.
struct Standardized {
    z: Array2<f64>,
    means: Array1<f64>,
    scales: Array1<f64>,
    constant: Vec<bool>,
}

impl Standardized {
    fn new(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<Self, ModelError> {
        if x.nrows() == 0 || x.nrows() != y.len() {
            return Err(ModelError::InvalidTrainingShape {
                rows: x.nrows(),
                targets: y.len(),
            });
        }
        let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
        let std = x.std_axis(Axis(0), 0.0);
        let constant: Vec<bool> = std.iter().map(|&sd| sd <= MIN_FEATURE_SCALE).collect();
        let scales = std.mapv(|sd| if sd > MIN_FEATURE_SCALE { sd } else { 1.0 });
        let z = (&x - &means) / &scales;
        Ok(Self {
            z,
            means,
            scales,
            constant,
        })
    }

    /// Solves `(DᵀWD + αP) β = DᵀWy` where `D = [1 | Z]` and `P` penalizes all but the intercept.
    /// Constant columns are all zero after centering; a unit diagonal pins their coefficient at 0.
    fn solve(
        &self,
        y: ArrayView1<f64>,
        weights: ArrayView1<f64>,
        alpha: f64,
    ) -> Result<(f64, Array1<f64>), ModelError> {
        let (n, p) = self.z.dim();
        let mut design = Array2::<f64>::ones((n, p + 1));
        design.slice_mut(s![.., 1..]).assign(&self.z);

        let weighted = &design * &weights.insert_axis(Axis(1));
        let mut gram = weighted.t().dot(&design);
        for (j, &constant) in self.constant.iter().enumerate() {
            gram[[j + 1, j + 1]] += if constant { 1.0 } else { alpha };
        }
        let rhs = weighted.t().dot(&y);
        let beta = gram.solve_into(rhs)?;
        Ok((beta[0], beta.slice(s![1..]).to_owned()))
    }

    fn into_model(self, intercept: f64, coefficients: Array1<f64>) -> LinearModel {
        LinearModel {
            feature_names: FEATURE_NAMES.iter().map(|n| n.to_string()).collect(),
            means: self.means.to_vec(),
            scales: self.scales.to_vec(),
            intercept,
            coefficients: coefficients.to_vec(),
        }
    }
}

/// The central age estimate, persisted as `point_model.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointEstimator {
    pub model_version: String,
    pub model: LinearModel,
}

impl Regressor for PointEstimator {
    fn n_features(&self) -> usize {
        self.model.n_features()
    }

    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        self.model.predict(row)
    }
}

/// Lower and upper quantile estimates, persisted as `quantile_model.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileEstimator {
    pub model_version: String,
    pub low_quantile: f64,
    pub high_quantile: f64,
    pub low: LinearModel,
    pub high: LinearModel,
}

impl QuantileEstimator {
    /// `(low, high)` raw predictions for one row.
    pub fn predict_bounds(&self, row: ArrayView1<f64>) -> (f64, f64) {
        (self.low.predict(row), self.high.predict(row))
    }
}

impl Regressor for QuantileEstimator {
    fn n_features(&self) -> usize {
        self.low.n_features()
    }

    /// Midpoint of the two bounds.
    fn predict(&self, row: ArrayView1<f64>) -> f64 {
        let (low, high) = self.predict_bounds(row);
        (low + high) / 2.0
    }
}

fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), ModelError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    Ok(())
}

impl PointEstimator {
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        write_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let estimator: Self = toml::from_str(&toml_string)?;
        estimator.model.check_features()?;
        Ok(estimator)
    }
}

impl QuantileEstimator {
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        write_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let estimator: Self = toml::from_str(&toml_string)?;
        estimator.low.check_features()?;
        estimator.high.check_features()?;
        Ok(estimator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FEATURE_COUNT;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    /// y = 30 + 2*x0 - x1 over a small grid, all other columns constant.
    fn linear_data(n: usize) -> (Array2<f64>, Array1<f64>) {
        let mut x = Array2::<f64>::zeros((n, FEATURE_COUNT));
        let mut y = Array1::<f64>::zeros(n);
        for i in 0..n {
            let a = (i % 7) as f64;
            let b = (i % 5) as f64;
            x[[i, 0]] = a;
            x[[i, 1]] = b;
            x[[i, 12]] = 2.0;
            y[i] = 30.0 + 2.0 * a - b;
        }
        (x, y)
    }

    #[test]
    fn unpenalized_ridge_recovers_exact_linear_relation() {
        let (x, y) = linear_data(70);
        let model = LinearModel::fit_ridge(x.view(), y.view(), 0.0).unwrap();
        for i in [0, 13, 42, 69] {
            assert_abs_diff_eq!(model.predict(x.row(i)), y[i], epsilon = 1e-8);
        }
        assert_eq!(model.n_features(), FEATURE_COUNT);
        // Constant columns keep unit scale and contribute nothing.
        assert_eq!(model.scales[12], 1.0);
    }

    #[test]
    fn ridge_penalty_shrinks_slopes_but_not_the_mean() {
        let (x, y) = linear_data(70);
        let loose = LinearModel::fit_ridge(x.view(), y.view(), 0.0).unwrap();
        let tight = LinearModel::fit_ridge(x.view(), y.view(), 1e4).unwrap();
        assert!(tight.coefficients[0].abs() < loose.coefficients[0].abs());
        assert_abs_diff_eq!(tight.intercept, y.mean().unwrap(), epsilon = 1e-9);
    }

    #[test]
    fn quantile_fits_bracket_the_data() {
        let (x, mut y) = linear_data(200);
        for (i, value) in y.iter_mut().enumerate() {
            *value += if i % 2 == 0 { 4.0 } else { -4.0 };
        }
        let low = LinearModel::fit_quantile(x.view(), y.view(), 0.1, 0.0, 200, 1e-8).unwrap();
        let high = LinearModel::fit_quantile(x.view(), y.view(), 0.9, 0.0, 200, 1e-8).unwrap();
        let below_low = (0..200).filter(|&i| y[i] < low.predict(x.row(i)) - 1e-3).count();
        let above_high = (0..200).filter(|&i| y[i] > high.predict(x.row(i)) + 1e-3).count();
        assert!(below_low <= 40, "{below_low} rows below the low quantile");
        assert!(above_high <= 40, "{above_high} rows above the high quantile");
        for i in 0..200 {
            assert!(low.predict(x.row(i)) < high.predict(x.row(i)));
        }
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let x = Array2::<f64>::zeros((3, FEATURE_COUNT));
        let y = Array1::<f64>::zeros(2);
        match LinearModel::fit_ridge(x.view(), y.view(), 1.0) {
            Err(ModelError::InvalidTrainingShape { rows, targets }) => {
                assert_eq!((rows, targets), (3, 2));
            }
            other => panic!("expected InvalidTrainingShape, got {other:?}"),
        }
    }

    #[test]
    fn artifacts_survive_toml_and_reject_foreign_features() {
        let (x, y) = linear_data(35);
        let estimator = PointEstimator {
            model_version: "v-test".to_string(),
            model: LinearModel::fit_ridge(x.view(), y.view(), 1.0).unwrap(),
        };
        let dir = tempdir().unwrap();
        let path = dir.path().join("point_model.toml");
        estimator.save(&path).unwrap();
        let loaded = PointEstimator::load(&path).unwrap();
        assert_eq!(loaded.model_version, "v-test");
        for i in 0..35 {
            assert_abs_diff_eq!(
                loaded.predict(x.row(i)),
                estimator.predict(x.row(i)),
                epsilon = 1e-9
            );
        }

        let mut foreign = estimator.clone();
        foreign.model.feature_names[0] = "shoe_size".to_string();
        foreign.save(&path).unwrap();
        match PointEstimator::load(&path) {
            Err(ModelError::FeatureMismatch { found, .. }) => assert_eq!(found[0], "shoe_size"),
            other => panic!("expected FeatureMismatch, got {other:?}"),
        }
    }
}
