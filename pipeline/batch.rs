// ========================================================================================
//
//                        DISJOINT SHARD EXECUTION AND RENDEZVOUS
//
// ========================================================================================
//
// The population is split by `id mod total_batches` into shards that share nothing but
// the read-only model artifacts. Each shard assembles serving features for its rows,
// scores them and writes its own output file, so re-running a shard only ever
// overwrites that shard's file. The merge stage waits here until every shard file exists.
//
// A run owns its predictions directory. Shard files left by an earlier run, possibly
// one with a different shard count, would otherwise be merged alongside the new ones
// and surface as duplicate predictions. `run_all_shards` clears the directory before
// scoring, `pre_run_cleanup` does the same for runs whose shards are launched
// separately, and the rendezvous can be told to ignore files older than the run.

use crate::features::{AssemblyError, FeatureEncodingProfile, assemble_all};
use crate::model::infer::{InferenceError, score_matrix};
use crate::model::regressor::{ModelError, PointEstimator, QuantileEstimator};
use crate::model::train::{POINT_MODEL_FILE, QUANTILE_MODEL_FILE};
use crate::shared::files::{self, DataError};
use crate::types::{
    IdentityKey, PredictionRecord, RawProfileRecord, RunContext, STATUS_HAS_PREDICTION,
};
use ahash::AHashSet;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Batch id {batch_id} is outside 0..{total_batches}.")]
    InvalidBatchId { batch_id: u32, total_batches: u32 },
    #[error("Shard {batch_id} failed while assembling features: {source}")]
    Assembly {
        batch_id: u32,
        #[source]
        source: AssemblyError,
    },
    #[error("Shard {batch_id} failed while scoring: {source}")]
    Inference {
        batch_id: u32,
        #[source]
        source: InferenceError,
    },
    #[error("Shard {batch_id} failed while writing its output: {source}")]
    Write {
        batch_id: u32,
        #[source]
        source: DataError,
    },
    #[error("Could not list shard outputs: {0}")]
    Listing(#[source] DataError),
    #[error("Could not clear previous outputs: {0}")]
    Cleanup(#[source] DataError),
    #[error("{remaining} shard files are still present in {} after cleanup", .dir.display())]
    CleanupIncomplete { dir: PathBuf, remaining: usize },
    #[error(
        "{} of {expected} shard outputs still missing after {waited_secs}s (first missing: {:?})",
        .missing.len(),
        .missing.iter().take(10).collect::<Vec<_>>()
    )]
    MissingOutputs {
        expected: u32,
        missing: Vec<u32>,
        waited_secs: u64,
    },
}

impl ShardError {
    /// The shard this failure belongs to, when it belongs to exactly one.
    pub fn batch_id(&self) -> Option<u32> {
        match self {
            ShardError::InvalidBatchId { batch_id, .. }
            | ShardError::Assembly { batch_id, .. }
            | ShardError::Inference { batch_id, .. }
            | ShardError::Write { batch_id, .. } => Some(*batch_id),
            ShardError::Listing(_)
            | ShardError::Cleanup(_)
            | ShardError::CleanupIncomplete { .. }
            | ShardError::MissingOutputs { .. } => None,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            ShardError::InvalidBatchId { .. } => "validate",
            ShardError::Assembly { .. } => "assemble",
            ShardError::Inference { .. } => "score",
            ShardError::Write { .. } => "write",
            ShardError::Cleanup(_) | ShardError::CleanupIncomplete { .. } => "cleanup",
            ShardError::Listing(_) | ShardError::MissingOutputs { .. } => "await",
        }
    }
}

/// One shard of the population: ids with `id mod total_batches == batch_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub batch_id: u32,
    pub total_batches: u32,
}

impl ShardSpec {
    pub fn new(batch_id: u32, total_batches: u32) -> Result<Self, ShardError> {
        if total_batches == 0 || batch_id >= total_batches {
            return Err(ShardError::InvalidBatchId {
                batch_id,
                total_batches,
            });
        }
        Ok(Self {
            batch_id,
            total_batches,
        })
    }

    pub fn contains(&self, id: IdentityKey) -> bool {
        shard_of(id, self.total_batches) == self.batch_id
    }

    pub fn output_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(files::shard_file_name(self.batch_id))
    }
}

/// Non-negative remainder, so negative ids still land in a valid shard.
fn shard_of(id: IdentityKey, total_batches: u32) -> u32 {
    id.0.rem_euclid(i64::from(total_batches)) as u32
}

/// Every batch id of a run, in order.
pub fn list_batch_ids(total_batches: u32) -> Vec<u32> {
    (0..total_batches).collect()
}

/// The two read-only artifacts every shard scores with.
#[derive(Debug, Clone)]
pub struct ScoringModels {
    pub point: PointEstimator,
    pub quantiles: QuantileEstimator,
}

impl ScoringModels {
    pub fn load(model_dir: &Path) -> Result<Self, ModelError> {
        let point = PointEstimator::load(&model_dir.join(POINT_MODEL_FILE))?;
        let quantiles = QuantileEstimator::load(&model_dir.join(QUANTILE_MODEL_FILE))?;
        info!(
            "Loaded models '{}' and '{}' from {}",
            point.model_version,
            quantiles.model_version,
            model_dir.display()
        );
        Ok(Self { point, quantiles })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    Completed,
    /// The shard had no rows needing a prediction; an empty output file was still written.
    NoEligibleRows,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardReport {
    pub batch_id: u32,
    pub status: ShardStatus,
    pub rows_processed: usize,
    pub elapsed_secs: f64,
    pub output_path: PathBuf,
}

/// Outcome of running many shards: the ones that finished and the ones that failed.
#[derive(Debug, Default)]
pub struct ShardRunSummary {
    pub reports: Vec<ShardReport>,
    pub failures: Vec<ShardError>,
}

impl ShardRunSummary {
    pub fn rows_processed(&self) -> usize {
        self.reports.iter().map(|r| r.rows_processed).sum()
    }
}

/// Scores the rows of one shard that lack an authoritative age.
pub fn run_shard(
    spec: ShardSpec,
    records: &[RawProfileRecord],
    models: &ScoringModels,
    ctx: &RunContext,
    output_dir: &Path,
) -> Result<ShardReport, ShardError> {
    let selected: Vec<&RawProfileRecord> = records
        .iter()
        .filter(|raw| spec.contains(raw.key()) && raw.needs_prediction())
        .collect();
    score_shard(spec, selected, models, ctx, output_dir)
}

fn score_shard(
    spec: ShardSpec,
    selected: Vec<&RawProfileRecord>,
    models: &ScoringModels,
    ctx: &RunContext,
    output_dir: &Path,
) -> Result<ShardReport, ShardError> {
    let start = Instant::now();
    let batch_id = spec.batch_id;

    // A key repeated in the source is scored once so the merge sees one prediction per key.
    let mut seen = AHashSet::with_capacity(selected.len());
    let before = selected.len();
    let selected: Vec<&RawProfileRecord> =
        selected.into_iter().filter(|raw| seen.insert(raw.id)).collect();
    if selected.len() < before {
        warn!(
            "Batch {batch_id}: {} repeated ids scored once",
            before - selected.len()
        );
    }

    let features = assemble_all(selected, FeatureEncodingProfile::Serving, ctx)
        .map_err(|source| ShardError::Assembly { batch_id, source })?;
    let scored = score_matrix(&models.point, &models.quantiles, &features)
        .map_err(|source| ShardError::Inference { batch_id, source })?;

    let prediction_ts = ctx.timestamp_string();
    let predictions: Vec<PredictionRecord> = scored
        .into_iter()
        .map(|row| PredictionRecord {
            id: row.id,
            predicted_age: row.predicted_age,
            confidence: row.confidence,
            prediction_ts: prediction_ts.clone(),
            model_version: models.point.model_version.clone(),
            batch_id,
            prediction_status: STATUS_HAS_PREDICTION.to_string(),
        })
        .collect();

    let output_path = spec.output_path(output_dir);
    files::write_predictions(&output_path, &predictions)
        .map_err(|source| ShardError::Write { batch_id, source })?;

    let elapsed_secs = start.elapsed().as_secs_f64();
    let status = if predictions.is_empty() {
        warn!("No rows need a prediction in batch {batch_id}");
        ShardStatus::NoEligibleRows
    } else {
        let mean_age = predictions.iter().map(|p| f64::from(p.predicted_age)).sum::<f64>()
            / predictions.len() as f64;
        info!(
            "Batch {batch_id} completed in {elapsed_secs:.2}s: {} predictions, average age {mean_age:.1}",
            predictions.len()
        );
        ShardStatus::Completed
    };

    Ok(ShardReport {
        batch_id,
        status,
        rows_processed: predictions.len(),
        elapsed_secs,
        output_path,
    })
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb.set_message(message.to_string());
    pb
}

/// What `pre_run_cleanup` removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub shard_files_removed: usize,
    pub final_entries_removed: usize,
}

/// Clears the outputs of any earlier run before a new one starts: every shard
/// file in `predictions_dir` and the whole `final_dir`. Fails if a shard file
/// survives, since the merge would read it back as a prediction of this run.
pub fn pre_run_cleanup(
    predictions_dir: &Path,
    final_dir: &Path,
) -> Result<CleanupReport, ShardError> {
    let shard_files_removed =
        files::clear_shard_outputs(predictions_dir).map_err(ShardError::Cleanup)?;
    let final_entries_removed = files::clear_directory(final_dir).map_err(ShardError::Cleanup)?;

    let remaining = files::list_shard_files(predictions_dir)
        .map_err(ShardError::Cleanup)?
        .len();
    if remaining > 0 {
        return Err(ShardError::CleanupIncomplete {
            dir: predictions_dir.to_path_buf(),
            remaining,
        });
    }
    info!(
        "Cleanup removed {shard_files_removed} shard files and {final_entries_removed} final output entries"
    );
    Ok(CleanupReport {
        shard_files_removed,
        final_entries_removed,
    })
}

/// Partitions the population once and runs every shard in parallel. A failing
/// shard does not stop the others; its error is collected with its batch id.
///
/// Any shard file already in `output_dir` is deleted first, so the directory
/// ends up holding exactly this run's `total_batches` files.
pub fn run_all_shards(
    records: &[RawProfileRecord],
    total_batches: u32,
    models: &ScoringModels,
    ctx: &RunContext,
    output_dir: &Path,
) -> Result<ShardRunSummary, ShardError> {
    if total_batches == 0 {
        return Err(ShardError::InvalidBatchId {
            batch_id: 0,
            total_batches,
        });
    }
    let stale = files::clear_shard_outputs(output_dir).map_err(ShardError::Cleanup)?;
    if stale > 0 {
        warn!("Removed {stale} shard files left by an earlier run");
    }

    let mut partitions: Vec<Vec<&RawProfileRecord>> = vec![Vec::new(); total_batches as usize];
    for raw in records.iter().filter(|raw| raw.needs_prediction()) {
        partitions[shard_of(raw.key(), total_batches) as usize].push(raw);
    }
    info!(
        "Scoring {} of {} rows across {total_batches} shards",
        partitions.iter().map(Vec::len).sum::<usize>(),
        records.len()
    );

    let pb = create_progress_bar(u64::from(total_batches), "shards");
    let outcomes: Vec<Result<ShardReport, ShardError>> = partitions
        .into_par_iter()
        .enumerate()
        .map(|(index, selected)| {
            let spec = ShardSpec {
                batch_id: index as u32,
                total_batches,
            };
            let outcome = score_shard(spec, selected, models, ctx, output_dir);
            pb.inc(1);
            outcome
        })
        .collect();
    pb.finish_and_clear();

    let mut summary = ShardRunSummary::default();
    for outcome in outcomes {
        match outcome {
            Ok(report) => summary.reports.push(report),
            Err(e) => {
                error!("{e}");
                summary.failures.push(e);
            }
        }
    }
    info!(
        "{} shards completed, {} failed, {} predictions written",
        summary.reports.len(),
        summary.failures.len(),
        summary.rows_processed()
    );
    Ok(summary)
}

/// Blocks until every expected shard file exists in `output_dir`, polling
/// every `poll_interval`. Returns the files in batch order.
///
/// With `not_before` set, a file last written before that instant belongs to an
/// earlier run and counts as missing.
pub fn await_shard_outputs(
    output_dir: &Path,
    total_batches: u32,
    not_before: Option<SystemTime>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Vec<PathBuf>, ShardError> {
    let start = Instant::now();
    loop {
        let present = files::list_shard_files(output_dir).map_err(ShardError::Listing)?;
        let mut found = vec![None; total_batches as usize];
        let mut stale = 0usize;
        for (batch_id, path) in present {
            let Some(slot) = found.get_mut(batch_id as usize) else {
                continue;
            };
            if let Some(cutoff) = not_before {
                if !files::written_since(&path, cutoff).map_err(ShardError::Listing)? {
                    stale += 1;
                    continue;
                }
            }
            *slot = Some(path);
        }
        if stale > 0 {
            debug!("{stale} shard files in {} predate this run", output_dir.display());
        }
        let missing: Vec<u32> = found
            .iter()
            .enumerate()
            .filter(|(_, path)| path.is_none())
            .map(|(batch_id, _)| batch_id as u32)
            .collect();
        if missing.is_empty() {
            info!("All {total_batches} shard outputs present in {}", output_dir.display());
            return Ok(found.into_iter().flatten().collect());
        }
        if start.elapsed() >= timeout {
            return Err(ShardError::MissingOutputs {
                expected: total_batches,
                missing,
                waited_secs: start.elapsed().as_secs(),
            });
        }
        info!(
            "Waiting for {} of {total_batches} shard outputs",
            missing.len()
        );
        thread::sleep(poll_interval.min(timeout.saturating_sub(start.elapsed())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FEATURE_COUNT, FEATURE_NAMES};
    use crate::merge::{ResolutionPolicy, guarantee_coverage};
    use crate::model::regressor::LinearModel;
    use crate::types::SourceRecord;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn flat_model(intercept: f64) -> LinearModel {
        LinearModel {
            feature_names: FEATURE_NAMES.iter().map(|n| n.to_string()).collect(),
            means: vec![0.0; FEATURE_COUNT],
            scales: vec![1.0; FEATURE_COUNT],
            intercept,
            coefficients: vec![0.0; FEATURE_COUNT],
        }
    }

    fn models() -> ScoringModels {
        ScoringModels {
            point: PointEstimator {
                model_version: "v-test".to_string(),
                model: flat_model(41.0),
            },
            quantiles: QuantileEstimator {
                model_version: "v-test".to_string(),
                low_quantile: 0.1,
                high_quantile: 0.9,
                low: flat_model(36.0),
                high: flat_model(47.5),
            },
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(), 2025)
    }

    fn population(n: i64) -> Vec<RawProfileRecord> {
        (0..n)
            .map(|id| {
                let mut raw = RawProfileRecord::new(id);
                if id % 5 == 0 {
                    raw.birth_year = Some("1985".to_string());
                }
                raw
            })
            .collect()
    }

    #[test]
    fn shard_predicate_uses_non_negative_remainder() {
        let spec = ShardSpec::new(2, 4).unwrap();
        assert!(spec.contains(IdentityKey(6)));
        assert!(spec.contains(IdentityKey(-2)));
        assert!(!spec.contains(IdentityKey(-3)));
        assert!(ShardSpec::new(4, 4).is_err());
        assert!(ShardSpec::new(0, 0).is_err());
        assert_eq!(list_batch_ids(3), vec![0, 1, 2]);
    }

    #[test]
    fn shards_partition_the_rows_needing_prediction() {
        let dir = tempdir().unwrap();
        let records = population(40);
        let summary = run_all_shards(&records, 4, &models(), &ctx(), dir.path()).unwrap();
        assert!(summary.failures.is_empty());
        assert_eq!(summary.reports.len(), 4);
        // ids divisible by 5 carry a birth year and are skipped.
        assert_eq!(summary.rows_processed(), 32);

        let mut seen: Vec<i64> = Vec::new();
        for report in &summary.reports {
            let rows = files::read_predictions(&report.output_path).unwrap();
            for p in &rows {
                assert_eq!(shard_of(p.id, 4), report.batch_id);
                assert_eq!(p.batch_id, report.batch_id);
                assert_eq!(p.predicted_age, 41);
                assert_eq!(p.confidence.0, 11.5);
                assert_eq!(p.prediction_ts, "2025-02-01T00:00:00Z");
                assert_eq!(p.model_version, "v-test");
            }
            seen.extend(rows.iter().map(|p| p.id.0));
        }
        seen.sort_unstable();
        let expected: Vec<i64> = (0..40).filter(|id| id % 5 != 0).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn rerunning_a_shard_only_touches_its_own_file() {
        let dir = tempdir().unwrap();
        let records = population(12);
        run_all_shards(&records, 3, &models(), &ctx(), dir.path()).unwrap();
        let other = ShardSpec::new(0, 3).unwrap().output_path(dir.path());
        let before = std::fs::read(&other).unwrap();

        let spec = ShardSpec::new(1, 3).unwrap();
        let report = run_shard(spec, &records, &models(), &ctx(), dir.path()).unwrap();
        assert_eq!(report.status, ShardStatus::Completed);
        assert_eq!(std::fs::read(&other).unwrap(), before);
    }

    #[test]
    fn repeated_ids_are_scored_once() {
        let dir = tempdir().unwrap();
        let records = vec![RawProfileRecord::new(4), RawProfileRecord::new(4)];
        let report =
            run_shard(ShardSpec::new(0, 2).unwrap(), &records, &models(), &ctx(), dir.path())
                .unwrap();
        assert_eq!(report.rows_processed, 1);
    }

    #[test]
    fn empty_shard_still_writes_a_file() {
        let dir = tempdir().unwrap();
        let records = vec![RawProfileRecord::new(1)];
        let report =
            run_shard(ShardSpec::new(0, 2).unwrap(), &records, &models(), &ctx(), dir.path())
                .unwrap();
        assert_eq!(report.status, ShardStatus::NoEligibleRows);
        assert!(report.output_path.exists());
    }

    #[test]
    fn waiting_names_the_missing_shards() {
        let dir = tempdir().unwrap();
        let records = population(6);
        run_shard(ShardSpec::new(0, 3).unwrap(), &records, &models(), &ctx(), dir.path()).unwrap();
        run_shard(ShardSpec::new(2, 3).unwrap(), &records, &models(), &ctx(), dir.path()).unwrap();

        let err =
            await_shard_outputs(dir.path(), 3, None, Duration::ZERO, Duration::from_millis(1))
                .unwrap_err();
        match &err {
            ShardError::MissingOutputs { missing, .. } => assert_eq!(missing, &vec![1]),
            other => panic!("expected MissingOutputs, got {other:?}"),
        }
        assert_eq!(err.stage(), "await");

        run_shard(ShardSpec::new(1, 3).unwrap(), &records, &models(), &ctx(), dir.path()).unwrap();
        let paths =
            await_shard_outputs(dir.path(), 3, None, Duration::ZERO, Duration::from_millis(1))
                .unwrap();
        assert_eq!(paths.len(), 3);
    }

    #[test]
    fn files_older_than_the_run_do_not_satisfy_the_wait() {
        let dir = tempdir().unwrap();
        run_all_shards(&population(6), 2, &models(), &ctx(), dir.path()).unwrap();

        let later = SystemTime::now() + Duration::from_secs(3600);
        let err = await_shard_outputs(
            dir.path(),
            2,
            Some(later),
            Duration::ZERO,
            Duration::from_millis(1),
        )
        .unwrap_err();
        match err {
            ShardError::MissingOutputs { missing, .. } => assert_eq!(missing, vec![0, 1]),
            other => panic!("expected MissingOutputs, got {other:?}"),
        }

        let earlier = SystemTime::UNIX_EPOCH;
        let paths = await_shard_outputs(
            dir.path(),
            2,
            Some(earlier),
            Duration::ZERO,
            Duration::from_millis(1),
        )
        .unwrap();
        assert_eq!(paths.len(), 2);
    }

    #[test]
    fn rerun_with_fewer_shards_replaces_the_earlier_outputs() {
        let dir = tempdir().unwrap();
        let records = population(40);
        run_all_shards(&records, 4, &models(), &ctx(), dir.path()).unwrap();
        run_all_shards(&records, 2, &models(), &ctx(), dir.path()).unwrap();

        let listed: Vec<u32> = files::list_shard_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|(batch_id, _)| batch_id)
            .collect();
        assert_eq!(listed, vec![0, 1]);

        let predictions = files::read_prediction_dir(dir.path(), 2).unwrap();
        let sources: Vec<SourceRecord> = records.iter().map(SourceRecord::from).collect();
        let (merged, report) = guarantee_coverage(
            &sources,
            &predictions,
            &ResolutionPolicy::default(),
            "2025-02-01T00:00:00Z",
        )
        .unwrap();
        assert_eq!(merged.len(), 40);
        assert_eq!(report.ml_prediction, 32);
    }

    #[test]
    fn stale_batch_ids_beyond_the_run_are_never_merged() {
        let dir = tempdir().unwrap();
        let records = population(40);
        run_all_shards(&records, 4, &models(), &ctx(), dir.path()).unwrap();
        // A second run launched shard by shard cannot clear the directory itself.
        for batch_id in 0..2 {
            let spec = ShardSpec::new(batch_id, 2).unwrap();
            run_shard(spec, &records, &models(), &ctx(), dir.path()).unwrap();
        }

        let predictions = files::read_prediction_dir(dir.path(), 2).unwrap();
        assert_eq!(predictions.len(), 32);
        assert!(predictions.iter().all(|p| p.batch_id < 2));
    }

    #[test]
    fn cleanup_clears_shards_and_final_output() {
        let dir = tempdir().unwrap();
        let predictions_dir = dir.path().join("predictions");
        let final_dir = dir.path().join("final");
        run_all_shards(&population(9), 3, &models(), &ctx(), &predictions_dir).unwrap();
        std::fs::create_dir_all(&final_dir).unwrap();
        std::fs::write(final_dir.join(files::FINAL_PART_FILE), "old").unwrap();
        std::fs::write(predictions_dir.join("README"), "kept").unwrap();

        let report = pre_run_cleanup(&predictions_dir, &final_dir).unwrap();
        assert_eq!(report.shard_files_removed, 3);
        assert_eq!(report.final_entries_removed, 1);
        assert!(!final_dir.exists());
        assert!(predictions_dir.join("README").exists());

        let again = pre_run_cleanup(&predictions_dir, &final_dir).unwrap();
        assert_eq!(again, CleanupReport::default());
    }
}
