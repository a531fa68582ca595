//! # Model Inference Adapter
//!
//! Scores a feature matrix with a point regressor and a quantile pair, then
//! applies the output contract: integer ages rounded half-to-even and clamped
//! to [18, 75], and an interval-width confidence rounded to two decimals.

use crate::features::{FEATURE_COUNT, FeatureMatrix};
use crate::model::regressor::{QuantileEstimator, Regressor};
use crate::types::{IdentityKey, IntervalWidth};
use ndarray::{ArrayView2, Axis};
use rayon::prelude::*;
use thiserror::Error;

pub const MIN_PREDICTED_AGE: i32 = 18;
pub const MAX_PREDICTED_AGE: i32 = 75;

/// Rows per independently scored chunk.
pub const INFERENCE_CHUNK_ROWS: usize = 8_192;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("Feature matrix has {found} columns, but the model expects {expected}.")]
    SchemaMismatch { expected: usize, found: usize },
    #[error("Feature matrix has {ids} ids for {rows} rows.")]
    RowCountMismatch { ids: usize, rows: usize },
    #[error("Non-finite input feature at row {row}, column {column}.")]
    NonFiniteInput { row: usize, column: usize },
    #[error("Model produced a non-finite {output} for id {id}.")]
    NonFiniteOutput { id: IdentityKey, output: &'static str },
}

/// The contract-shaped result for one row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredRow {
    pub id: IdentityKey,
    pub predicted_age: i32,
    pub confidence: IntervalWidth,
}

/// Rounds to the nearest integer, ties to even, then clamps to the allowed age range.
pub fn finalize_age(raw: f64) -> i32 {
    let rounded = raw.round_ties_even();
    rounded.clamp(f64::from(MIN_PREDICTED_AGE), f64::from(MAX_PREDICTED_AGE)) as i32
}

/// Rounds `high - low` to two decimals.
pub fn interval_width(low: f64, high: f64) -> IntervalWidth {
    IntervalWidth(((high - low) * 100.0).round_ties_even() / 100.0)
}

/// Scores every row of `features`. Chunks are processed in parallel and the
/// output preserves row order.
pub fn score_matrix<P: Regressor + Sync>(
    point: &P,
    quantiles: &QuantileEstimator,
    features: &FeatureMatrix,
) -> Result<Vec<ScoredRow>, InferenceError> {
    validate(point, quantiles, features)?;

    let chunks: Vec<(&[IdentityKey], ArrayView2<f64>)> = features
        .ids
        .chunks(INFERENCE_CHUNK_ROWS)
        .zip(features.values.axis_chunks_iter(Axis(0), INFERENCE_CHUNK_ROWS))
        .collect();

    let scored = chunks
        .into_par_iter()
        .map(|(ids, block)| score_chunk(point, quantiles, ids, block))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(scored.into_iter().flatten().collect())
}

fn validate<P: Regressor>(
    point: &P,
    quantiles: &QuantileEstimator,
    features: &FeatureMatrix,
) -> Result<(), InferenceError> {
    let found = features.values.ncols();
    for expected in [FEATURE_COUNT, point.n_features(), quantiles.n_features()] {
        if found != expected {
            return Err(InferenceError::SchemaMismatch { expected, found });
        }
    }
    if features.ids.len() != features.values.nrows() {
        return Err(InferenceError::RowCountMismatch {
            ids: features.ids.len(),
            rows: features.values.nrows(),
        });
    }
    if let Some(((row, column), _)) = features.values.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(InferenceError::NonFiniteInput { row, column });
    }
    Ok(())
}

fn score_chunk<P: Regressor>(
    point: &P,
    quantiles: &QuantileEstimator,
    ids: &[IdentityKey],
    block: ArrayView2<f64>,
) -> Result<Vec<ScoredRow>, InferenceError> {
    ids.iter()
        .zip(block.rows())
        .map(|(&id, row)| {
            let raw = point.predict(row);
            if !raw.is_finite() {
                return Err(InferenceError::NonFiniteOutput {
                    id,
                    output: "point estimate",
                });
            }
            let (low, high) = quantiles.predict_bounds(row);
            if !low.is_finite() || !high.is_finite() {
                return Err(InferenceError::NonFiniteOutput {
                    id,
                    output: "quantile bound",
                });
            }
            Ok(ScoredRow {
                id,
                predicted_age: finalize_age(raw),
                confidence: interval_width(low, high),
            })
        })
        .collect()
}
