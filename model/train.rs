//! # Training Orchestration
//!
//! Joins assembled training features with observed ages, splits them with a
//! fixed seed, fits the point and quantile estimators and evaluates both on
//! the held-out rows.

use crate::config::TrainingConfig;
use crate::features::{FEATURE_COUNT, FeatureMatrix, FeatureVector, TrainingRow};
use crate::model::evaluate::{EvaluationReport, average_interval_width, evaluate};
use crate::model::regressor::{
    LinearModel, ModelError, PointEstimator, QuantileEstimator, Regressor,
};
use crate::types::IdentityKey;
use ahash::AHashMap;
use log::{info, warn};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const POINT_MODEL_FILE: &str = "point_model.toml";
pub const QUANTILE_MODEL_FILE: &str = "quantile_model.toml";
pub const METRICS_FILE: &str = "evaluation_metrics.toml";

/// Both splits need at least one row.
const MIN_TRAINING_ROWS: usize = 2;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Only {found} labelled rows are available; at least {required} are needed to train.")]
    InsufficientRows { found: usize, required: usize },
    #[error("Failed to write training output: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to serialize evaluation metrics: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Everything a training run produces.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub point: PointEstimator,
    pub quantiles: QuantileEstimator,
    pub report: EvaluationReport,
}

/// Pairs each feature row with its observed age. Rows without a target are
/// dropped and the result is capped at `max_rows`, keeping feature order.
pub fn join_targets(
    features: &FeatureMatrix,
    targets: &AHashMap<IdentityKey, f64>,
    max_rows: usize,
) -> Vec<TrainingRow> {
    let mut missing = 0usize;
    let mut rows = Vec::with_capacity(features.len().min(max_rows));
    for (id, values) in features.ids.iter().zip(features.values.rows()) {
        let Some(&target) = targets.get(id) else {
            missing += 1;
            continue;
        };
        if rows.len() == max_rows {
            break;
        }
        let mut vector = [0.0; FEATURE_COUNT];
        for (slot, value) in vector.iter_mut().zip(values) {
            *slot = *value;
        }
        rows.push(TrainingRow {
            id: *id,
            features: FeatureVector(vector),
            target,
        });
    }
    if missing > 0 {
        warn!("{missing} feature rows have no observed age and were skipped");
    }
    rows
}

/// Seeded shuffle split. The validation share is rounded up, as long as one
/// training row remains.
pub fn split_rows(
    rows: &[TrainingRow],
    validation_fraction: f64,
    seed: u64,
) -> (Vec<TrainingRow>, Vec<TrainingRow>) {
    let mut order: Vec<usize> = (0..rows.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let n_validation = ((rows.len() as f64 * validation_fraction).ceil() as usize)
        .min(rows.len().saturating_sub(1));
    let (validation, training) = order.split_at(n_validation);
    (
        training.iter().map(|&i| rows[i]).collect(),
        validation.iter().map(|&i| rows[i]).collect(),
    )
}

fn to_arrays(rows: &[TrainingRow]) -> (Array2<f64>, Array1<f64>) {
    let mut x = Array2::<f64>::zeros((rows.len(), FEATURE_COUNT));
    for (mut target_row, row) in x.rows_mut().into_iter().zip(rows) {
        target_row.assign(&row.features.view());
    }
    let y = rows.iter().map(|row| row.target).collect();
    (x, y)
}

/// Fits both estimators and evaluates them on the held-out split.
pub fn train_models(
    rows: &[TrainingRow],
    config: &TrainingConfig,
    model_version: &str,
    evaluation_date: &str,
) -> Result<TrainingOutcome, TrainingError> {
    if rows.len() < MIN_TRAINING_ROWS {
        return Err(TrainingError::InsufficientRows {
            found: rows.len(),
            required: MIN_TRAINING_ROWS,
        });
    }
    let (train, validation) = split_rows(rows, config.validation_fraction, config.split_seed);
    info!(
        "Training on {} rows, validating on {} rows",
        train.len(),
        validation.len()
    );
    let (x_train, y_train) = to_arrays(&train);
    let (x_val, y_val) = to_arrays(&validation);

    info!("Fitting ridge point estimator (alpha = {})", config.ridge_alpha);
    let point = PointEstimator {
        model_version: model_version.to_string(),
        model: LinearModel::fit_ridge(x_train.view(), y_train.view(), config.ridge_alpha)?,
    };

    info!(
        "Fitting quantile estimators at {} and {}",
        config.quantile_low, config.quantile_high
    );
    let fit_quantile = |tau: f64| {
        LinearModel::fit_quantile(
            x_train.view(),
            y_train.view(),
            tau,
            config.ridge_alpha,
            config.quantile_max_iterations,
            config.quantile_tolerance,
        )
    };
    let (low, high) = rayon::join(
        || fit_quantile(config.quantile_low),
        || fit_quantile(config.quantile_high),
    );
    let quantiles = QuantileEstimator {
        model_version: model_version.to_string(),
        low_quantile: config.quantile_low,
        high_quantile: config.quantile_high,
        low: low?,
        high: high?,
    };

    let point_predictions: Array1<f64> =
        x_val.rows().into_iter().map(|r| point.predict(r)).collect();
    let (low_predictions, high_predictions): (Vec<f64>, Vec<f64>) = x_val
        .rows()
        .into_iter()
        .map(|r| quantiles.predict_bounds(r))
        .unzip();
    let low_predictions = Array1::from(low_predictions);
    let high_predictions = Array1::from(high_predictions);
    let midpoints = (&low_predictions + &high_predictions) / 2.0;

    let point_metrics = evaluate(
        "Ridge",
        model_version,
        evaluation_date,
        y_val.view(),
        point_predictions.view(),
    );
    let mut quantile_metrics = evaluate(
        "Quantile",
        model_version,
        evaluation_date,
        y_val.view(),
        midpoints.view(),
    );
    let width = average_interval_width(low_predictions.view(), high_predictions.view());
    info!("Average interval width: {width:.2} years");
    quantile_metrics.avg_interval_width = Some(width);

    Ok(TrainingOutcome {
        point,
        quantiles,
        report: EvaluationReport {
            point: point_metrics,
            quantile: quantile_metrics,
        },
    })
}

/// Writes the two model artifacts and the metrics report into `dir`.
pub fn save_outcome(outcome: &TrainingOutcome, dir: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    fs::create_dir_all(dir)?;
    let point_path = dir.join(POINT_MODEL_FILE);
    let quantile_path = dir.join(QUANTILE_MODEL_FILE);
    let metrics_path = dir.join(METRICS_FILE);
    outcome.point.save(&point_path)?;
    outcome.quantiles.save(&quantile_path)?;
    fs::write(&metrics_path, toml::to_string_pretty(&outcome.report)?)?;
    info!("Saved model artifacts to {}", dir.display());
    Ok(vec![point_path, quantile_path, metrics_path])
}
