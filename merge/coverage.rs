//! # Coverage Guarantor
//!
//! Drives the final merge from the source population outward: every distinct
//! source key produces exactly one output row, whether or not a prediction
//! exists for it. The row count is checked after the fact and a mismatch is
//! fatal.

use crate::merge::resolve::{ResolutionPolicy, resolve};
use crate::types::{
    FinalResultRecord, IdentityKey, PredictionRecord, PredictionSource, SourceRecord,
};
use ahash::{AHashMap, AHashSet};
use log::{info, warn};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoverageError {
    #[error("Prediction shards contain id {id} more than once (batches {first_batch} and {second_batch}).")]
    DuplicatePrediction {
        id: IdentityKey,
        first_batch: u32,
        second_batch: u32,
    },
    #[error("Final table has {found} rows for {expected} distinct source ids.")]
    CountMismatch { expected: usize, found: usize },
}

/// Counts gathered while merging, for logging and the run summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageReport {
    pub source_rows: usize,
    pub distinct_keys: usize,
    pub predictions: usize,
    pub orphan_predictions: usize,
    pub existing_approx_age: usize,
    pub existing_birth_year: usize,
    pub ml_prediction: usize,
    pub default_rule: usize,
}

impl CoverageReport {
    fn tally(&mut self, source: PredictionSource) {
        match source {
            PredictionSource::ExistingApproxAge => self.existing_approx_age += 1,
            PredictionSource::ExistingBirthYear => self.existing_birth_year += 1,
            PredictionSource::MlPrediction => self.ml_prediction += 1,
            PredictionSource::DefaultRule => self.default_rule += 1,
        }
    }
}

/// Indexes predictions by key, rejecting any key that appears twice.
pub fn index_predictions(
    predictions: &[PredictionRecord],
) -> Result<AHashMap<IdentityKey, &PredictionRecord>, CoverageError> {
    let mut index = AHashMap::with_capacity(predictions.len());
    for p in predictions {
        if let Some(previous) = index.insert(p.id, p) {
            return Err(CoverageError::DuplicatePrediction {
                id: p.id,
                first_batch: previous.batch_id,
                second_batch: p.batch_id,
            });
        }
    }
    Ok(index)
}

/// Left-joins every distinct source key against the predictions and resolves
/// each one. Output order follows the first occurrence of each key in `sources`.
pub fn guarantee_coverage(
    sources: &[SourceRecord],
    predictions: &[PredictionRecord],
    policy: &ResolutionPolicy,
    qa_timestamp: &str,
) -> Result<(Vec<FinalResultRecord>, CoverageReport), CoverageError> {
    let index = index_predictions(predictions)?;
    let mut report = CoverageReport {
        source_rows: sources.len(),
        predictions: predictions.len(),
        ..CoverageReport::default()
    };

    let mut seen = AHashSet::with_capacity(sources.len());
    let mut output = Vec::with_capacity(sources.len());
    for source in sources {
        if !seen.insert(source.id) {
            continue;
        }
        let record = resolve(source, index.get(&source.id).copied(), policy, qa_timestamp);
        report.tally(record.prediction_source);
        output.push(record);
    }
    report.distinct_keys = seen.len();
    report.orphan_predictions = index.keys().filter(|id| !seen.contains(*id)).count();

    let duplicates = report.source_rows - report.distinct_keys;
    if duplicates > 0 {
        warn!("{duplicates} duplicate source rows collapsed to their first occurrence");
    }
    if report.orphan_predictions > 0 {
        warn!(
            "{} predictions reference ids outside the source population and were ignored",
            report.orphan_predictions
        );
    }

    verify_coverage(&output, report.distinct_keys)?;
    info!(
        "Merged {} records: {} approximate age, {} birth year, {} predicted, {} default",
        output.len(),
        report.existing_approx_age,
        report.existing_birth_year,
        report.ml_prediction,
        report.default_rule
    );
    Ok((output, report))
}

/// Post-condition: one row per distinct source key, none repeated.
pub fn verify_coverage(
    output: &[FinalResultRecord],
    distinct_source_keys: usize,
) -> Result<(), CoverageError> {
    let distinct_output: AHashSet<IdentityKey> = output.iter().map(|r| r.id).collect();
    if output.len() != distinct_source_keys || distinct_output.len() != output.len() {
        return Err(CoverageError::CountMismatch {
            expected: distinct_source_keys,
            found: output.len(),
        });
    }
    Ok(())
}
