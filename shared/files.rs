// ========================================================================================
//
//                          COLUMNAR FILE I/O FOR EVERY STAGE
//
// ========================================================================================
//
// All table reads and writes go through `polars`. Inputs may be Parquet (`.parquet`,
// `.pq`) or tab-separated text; every output is Snappy-compressed Parquet. Tab-separated
// input is read with every column as text, and raw profile columns are cast to text
// regardless of the type a Parquet file declares, so that the field parser sees one
// representation and a stray value deep in a file never fails the whole read.

use crate::features::{FEATURE_COUNT, FEATURE_NAMES, FeatureMatrix};
use crate::types::{
    FinalResultRecord, IdentityKey, IntervalWidth, PredictionRecord, RawProfileRecord,
    SourceRecord,
};
use ahash::AHashMap;
use log::{debug, info, warn};
use ndarray::{Array2, ShapeBuilder};
use polars::prelude::*;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

pub const FINAL_PART_FILE: &str = "part-00000.parquet";
const SHARD_PREFIX: &str = "batch_";
const SHARD_SUFFIX: &str = ".parquet";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The required column '{column}' was not found in '{path}'.")]
    ColumnNotFound { column: String, path: String },
    #[error("Column '{column}' in '{path}' has a missing or unreadable value at row {row}.")]
    MissingValue {
        column: String,
        path: String,
        row: usize,
    },
    #[error("Column '{column}' in '{path}' has an out-of-range value {value} at row {row}.")]
    OutOfRange {
        column: String,
        path: String,
        row: usize,
        value: i64,
    },
}

// ========================================================================================
//                                  READ HELPERS
// ========================================================================================

fn read_tabular(path: &Path) -> Result<DataFrame, DataError> {
    let file = File::open(path)?;
    let df = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("parquet") | Some("pq") => ParquetReader::new(file).finish()?,
        _ => CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(0))
            .map_parse_options(|options| options.with_separator(b'\t').with_quote_char(None))
            .into_reader_with_file_handle(file)
            .finish()?,
    };
    debug!("Read {} rows x {} columns from {}", df.height(), df.width(), path.display());
    Ok(df)
}

/// A table plus the path it came from, so column errors can name the file.
struct Table {
    df: DataFrame,
    path: String,
}

impl Table {
    fn open(path: &Path) -> Result<Self, DataError> {
        Ok(Self {
            df: read_tabular(path)?,
            path: path.display().to_string(),
        })
    }

    fn has(&self, column: &str) -> bool {
        self.df.get_column_index(column).is_some()
    }

    fn column(&self, column: &str) -> Result<&Column, DataError> {
        if !self.has(column) {
            return Err(DataError::ColumnNotFound {
                column: column.to_string(),
                path: self.path.clone(),
            });
        }
        Ok(self.df.column(column)?)
    }

    fn missing(&self, column: &str, row: usize) -> DataError {
        DataError::MissingValue {
            column: column.to_string(),
            path: self.path.clone(),
            row,
        }
    }

    /// Every value as text. An absent column reads as all-missing.
    fn optional_strings(&self, column: &str) -> Result<Vec<Option<String>>, DataError> {
        if !self.has(column) {
            return Ok(vec![None; self.df.height()]);
        }
        let casted = self.df.column(column)?.cast(&DataType::String)?;
        Ok(casted
            .str()?
            .into_iter()
            .map(|value| value.map(str::to_string))
            .collect())
    }

    fn required_strings(&self, column: &str) -> Result<Vec<String>, DataError> {
        let casted = self.column(column)?.cast(&DataType::String)?;
        casted
            .str()?
            .into_iter()
            .enumerate()
            .map(|(row, value)| value.map(str::to_string).ok_or_else(|| self.missing(column, row)))
            .collect()
    }

    fn required_i64(&self, column: &str) -> Result<Vec<i64>, DataError> {
        let casted = self.column(column)?.cast(&DataType::Int64)?;
        casted
            .i64()?
            .into_iter()
            .enumerate()
            .map(|(row, value)| value.ok_or_else(|| self.missing(column, row)))
            .collect()
    }

    fn required_f64(&self, column: &str) -> Result<Vec<f64>, DataError> {
        let casted = self.column(column)?.cast(&DataType::Float64)?;
        casted
            .f64()?
            .into_iter()
            .enumerate()
            .map(|(row, value)| {
                value
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| self.missing(column, row))
            })
            .collect()
    }

    fn optional_f64(&self, column: &str) -> Result<Vec<Option<f64>>, DataError> {
        let casted = self.column(column)?.cast(&DataType::Float64)?;
        Ok(casted
            .f64()?
            .into_iter()
            .map(|value| value.filter(|v| v.is_finite()))
            .collect())
    }

    fn narrowed<T: TryFrom<i64>>(&self, column: &str) -> Result<Vec<T>, DataError> {
        self.required_i64(column)?
            .into_iter()
            .enumerate()
            .map(|(row, value)| {
                T::try_from(value).map_err(|_| DataError::OutOfRange {
                    column: column.to_string(),
                    path: self.path.clone(),
                    row,
                    value,
                })
            })
            .collect()
    }
}

// ========================================================================================
//                                  RAW PROFILES
// ========================================================================================

/// Reads the source population. Only `id` is required; every other column is optional.
pub fn read_raw_profiles(path: &Path) -> Result<Vec<RawProfileRecord>, DataError> {
    let table = Table::open(path)?;
    let ids = table.required_i64("id")?;

    let text = |column: &str| table.optional_strings(column);
    let mut education = text("education")?.into_iter();
    let mut work_experience = text("work_experience")?.into_iter();
    let mut skills = text("skills")?.into_iter();
    let mut job_level = text("job_level")?.into_iter();
    let mut job_title = text("job_title")?.into_iter();
    let mut compensation_range = text("compensation_range")?.into_iter();
    let mut employee_range = text("employee_range")?.into_iter();
    let mut industry = text("industry")?.into_iter();
    let mut job_function = text("job_function")?.into_iter();
    let mut revenue_range = text("revenue_range")?.into_iter();
    let mut job_start_date = text("job_start_date")?.into_iter();
    let mut ev_last_date = text("ev_last_date")?.into_iter();
    let mut linkedin_url_is_valid = text("linkedin_url_is_valid")?.into_iter();
    let mut linkedin_connection_count = text("linkedin_connection_count")?.into_iter();
    let mut work_email = text("work_email")?.into_iter();
    let mut personal_email = text("personal_email")?.into_iter();
    let mut facebook_url = text("facebook_url")?.into_iter();
    let mut twitter_url = text("twitter_url")?.into_iter();
    let mut birth_year = text("birth_year")?.into_iter();
    let mut approximate_age = text("approximate_age")?.into_iter();

    let records: Vec<RawProfileRecord> = ids
        .into_iter()
        .map(|id| RawProfileRecord {
            id,
            education: education.next().flatten(),
            work_experience: work_experience.next().flatten(),
            skills: skills.next().flatten(),
            job_level: job_level.next().flatten(),
            job_title: job_title.next().flatten(),
            compensation_range: compensation_range.next().flatten(),
            employee_range: employee_range.next().flatten(),
            industry: industry.next().flatten(),
            job_function: job_function.next().flatten(),
            revenue_range: revenue_range.next().flatten(),
            job_start_date: job_start_date.next().flatten(),
            ev_last_date: ev_last_date.next().flatten(),
            linkedin_url_is_valid: linkedin_url_is_valid.next().flatten(),
            linkedin_connection_count: linkedin_connection_count.next().flatten(),
            work_email: work_email.next().flatten(),
            personal_email: personal_email.next().flatten(),
            facebook_url: facebook_url.next().flatten(),
            twitter_url: twitter_url.next().flatten(),
            birth_year: birth_year.next().flatten(),
            approximate_age: approximate_age.next().flatten(),
        })
        .collect();
    info!("Loaded {} profile rows from {}", records.len(), path.display());
    Ok(records)
}

/// Reads only the authoritative age columns of the source population.
pub fn read_source_records(path: &Path) -> Result<Vec<SourceRecord>, DataError> {
    let table = Table::open(path)?;
    let ids = table.required_i64("id")?;
    let approximate_age = table.optional_strings("approximate_age")?;
    let birth_year = table.optional_strings("birth_year")?;
    Ok(ids
        .into_iter()
        .zip(approximate_age)
        .zip(birth_year)
        .map(|((id, approximate_age), birth_year)| {
            let raw = RawProfileRecord {
                approximate_age,
                birth_year,
                ..RawProfileRecord::new(id)
            };
            SourceRecord::from(&raw)
        })
        .collect())
}

/// Observed ages keyed by id. Rows with a missing or non-numeric age are skipped.
pub fn read_targets(path: &Path) -> Result<AHashMap<IdentityKey, f64>, DataError> {
    let table = Table::open(path)?;
    let ids = table.required_i64("id")?;
    let ages = table.optional_f64("actual_age")?;
    let mut targets = AHashMap::with_capacity(ids.len());
    let mut skipped = 0usize;
    for (id, age) in ids.into_iter().zip(ages) {
        match age {
            Some(age) => {
                targets.entry(IdentityKey(id)).or_insert(age);
            }
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("{skipped} target rows in {} have no usable age", path.display());
    }
    Ok(targets)
}

// ========================================================================================
//                                    FEATURES
// ========================================================================================

fn write_parquet(path: &Path, df: &mut DataFrame) -> Result<(), DataError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Snappy)
        .finish(df)?;
    debug!("Wrote {} rows to {}", df.height(), path.display());
    Ok(())
}

pub fn write_features(
    path: &Path,
    features: &FeatureMatrix,
    feature_creation_date: &str,
    feature_version: &str,
) -> Result<(), DataError> {
    let n = features.len();
    let mut columns: Vec<Column> = Vec::with_capacity(FEATURE_COUNT + 3);
    let ids: Vec<i64> = features.ids.iter().map(|id| id.0).collect();
    columns.push(Series::new("id".into(), ids).into());
    for (index, name) in FEATURE_NAMES.iter().enumerate() {
        let values: Vec<f64> = features.values.column(index).to_vec();
        columns.push(Series::new((*name).into(), values).into());
    }
    columns.push(
        Series::new("feature_creation_date".into(), vec![feature_creation_date; n]).into(),
    );
    columns.push(Series::new("feature_version".into(), vec![feature_version; n]).into());
    let mut df = DataFrame::new(columns)?;
    write_parquet(path, &mut df)
}

/// Reads `id` plus the canonical feature columns. Extra columns are ignored.
pub fn read_features(path: &Path) -> Result<FeatureMatrix, DataError> {
    let table = Table::open(path)?;
    let ids: Vec<IdentityKey> = table.required_i64("id")?.into_iter().map(IdentityKey).collect();
    let mut buffer = Vec::with_capacity(ids.len() * FEATURE_COUNT);
    for name in FEATURE_NAMES {
        buffer.extend(table.required_f64(name)?);
    }
    let values = Array2::from_shape_vec((ids.len(), FEATURE_COUNT).f(), buffer)
        .expect("feature columns should have consistent lengths");
    Ok(FeatureMatrix {
        ids,
        values: values.as_standard_layout().into_owned(),
    })
}

// ========================================================================================
//                                  SHARD OUTPUT
// ========================================================================================

pub fn shard_file_name(batch_id: u32) -> String {
    format!("{SHARD_PREFIX}{batch_id:04}{SHARD_SUFFIX}")
}

/// Batch id encoded in a shard file name, if the name is one.
pub fn parse_shard_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(SHARD_PREFIX)?
        .strip_suffix(SHARD_SUFFIX)?
        .parse()
        .ok()
}

pub fn write_predictions(path: &Path, predictions: &[PredictionRecord]) -> Result<(), DataError> {
    let mut df = DataFrame::new(vec![
        Series::new("id".into(), predictions.iter().map(|p| p.id.0).collect::<Vec<i64>>()).into(),
        Series::new(
            "predicted_age".into(),
            predictions.iter().map(|p| p.predicted_age).collect::<Vec<i32>>(),
        )
        .into(),
        Series::new(
            "confidence_score".into(),
            predictions.iter().map(|p| p.confidence.0).collect::<Vec<f64>>(),
        )
        .into(),
        Series::new(
            "prediction_ts".into(),
            predictions.iter().map(|p| p.prediction_ts.as_str()).collect::<Vec<&str>>(),
        )
        .into(),
        Series::new(
            "model_version".into(),
            predictions.iter().map(|p| p.model_version.as_str()).collect::<Vec<&str>>(),
        )
        .into(),
        Series::new(
            "batch_id".into(),
            predictions.iter().map(|p| p.batch_id as i32).collect::<Vec<i32>>(),
        )
        .into(),
        Series::new(
            "prediction_status".into(),
            predictions.iter().map(|p| p.prediction_status.as_str()).collect::<Vec<&str>>(),
        )
        .into(),
    ])?;
    write_parquet(path, &mut df)
}

pub fn read_predictions(path: &Path) -> Result<Vec<PredictionRecord>, DataError> {
    let table = Table::open(path)?;
    let ids = table.required_i64("id")?;
    let ages = table.narrowed::<i32>("predicted_age")?;
    let confidence = table.required_f64("confidence_score")?;
    let timestamps = table.required_strings("prediction_ts")?;
    let versions = table.required_strings("model_version")?;
    let batches = table.narrowed::<u32>("batch_id")?;
    let statuses = table.required_strings("prediction_status")?;

    Ok(ids
        .into_iter()
        .zip(ages)
        .zip(confidence)
        .zip(timestamps)
        .zip(versions)
        .zip(batches)
        .zip(statuses)
        .map(|((((((id, age), confidence), ts), version), batch_id), status)| {
            PredictionRecord {
                id: IdentityKey(id),
                predicted_age: age,
                confidence: IntervalWidth(confidence),
                prediction_ts: ts,
                model_version: version,
                batch_id,
                prediction_status: status,
            }
        })
        .collect())
}

/// Shard files present in `dir`, sorted by batch id.
pub fn list_shard_files(dir: &Path) -> Result<Vec<(u32, PathBuf)>, DataError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(batch_id) = entry.file_name().to_str().and_then(parse_shard_file_name) {
            shards.push((batch_id, entry.path()));
        }
    }
    shards.sort_unstable_by_key(|(batch_id, _)| *batch_id);
    Ok(shards)
}

/// True when `path` was last written at or after `not_before`.
pub fn written_since(path: &Path, not_before: SystemTime) -> Result<bool, DataError> {
    Ok(fs::metadata(path)?.modified()? >= not_before)
}

/// Deletes every shard file in `dir` and returns how many were removed. Other
/// files are left alone; a missing directory has nothing to clear.
pub fn clear_shard_outputs(dir: &Path) -> Result<usize, DataError> {
    let shards = list_shard_files(dir)?;
    for (_, path) in &shards {
        fs::remove_file(path)?;
    }
    if !shards.is_empty() {
        info!("Removed {} shard files from {}", shards.len(), dir.display());
    }
    Ok(shards.len())
}

/// Every prediction in the shard files of `dir` that belong to a run of
/// `total_batches` shards. Files with a larger batch id are left over from a
/// run with more shards and are skipped.
pub fn read_prediction_dir(
    dir: &Path,
    total_batches: u32,
) -> Result<Vec<PredictionRecord>, DataError> {
    let (shards, foreign): (Vec<_>, Vec<_>) = list_shard_files(dir)?
        .into_iter()
        .partition(|(batch_id, _)| *batch_id < total_batches);
    if !foreign.is_empty() {
        warn!(
            "Ignoring {} shard files in {} with a batch id outside 0..{total_batches}",
            foreign.len(),
            dir.display()
        );
    }
    let mut predictions = Vec::new();
    for (_, path) in &shards {
        predictions.extend(read_predictions(path)?);
    }
    info!(
        "Loaded {} predictions from {} shard files in {}",
        predictions.len(),
        shards.len(),
        dir.display()
    );
    Ok(predictions)
}

// ========================================================================================
//                                  FINAL RESULTS
// ========================================================================================

/// Removes `dir` and everything under it, returning how many entries it held.
pub fn clear_directory(dir: &Path) -> Result<usize, DataError> {
    if dir.is_dir() {
        let entries = fs::read_dir(dir)?.count();
        fs::remove_dir_all(dir)?;
        Ok(entries)
    } else if dir.exists() {
        fs::remove_file(dir)?;
        Ok(1)
    } else {
        Ok(0)
    }
}

/// Replaces the contents of `dir` with a single part file holding `records`.
pub fn write_final_results(
    dir: &Path,
    records: &[FinalResultRecord],
) -> Result<PathBuf, DataError> {
    clear_directory(dir)?;
    fs::create_dir_all(dir)?;

    let mut df = DataFrame::new(vec![
        Series::new("id".into(), records.iter().map(|r| r.id.0).collect::<Vec<i64>>()).into(),
        Series::new(
            "predicted_age".into(),
            records.iter().map(|r| r.predicted_age).collect::<Vec<i32>>(),
        )
        .into(),
        Series::new(
            "confidence_score".into(),
            records.iter().map(|r| r.confidence.value()).collect::<Vec<f64>>(),
        )
        .into(),
        Series::new(
            "qa_timestamp".into(),
            records.iter().map(|r| r.qa_timestamp.as_str()).collect::<Vec<&str>>(),
        )
        .into(),
        Series::new(
            "model_version".into(),
            records.iter().map(|r| r.model_version.as_str()).collect::<Vec<&str>>(),
        )
        .into(),
        Series::new(
            "prediction_status".into(),
            records.iter().map(|r| r.prediction_status.as_str()).collect::<Vec<&str>>(),
        )
        .into(),
        Series::new(
            "prediction_source".into(),
            records.iter().map(|r| r.prediction_source.as_str()).collect::<Vec<&str>>(),
        )
        .into(),
    ])?;
    let path = dir.join(FINAL_PART_FILE);
    write_parquet(&path, &mut df)?;
    info!("Wrote {} final records to {}", records.len(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureVector;
    use crate::types::{Confidence, PredictionSource, QualityPercent, STATUS_HAS_PREDICTION};
    use std::io::Write;
    use tempfile::{Builder, tempdir};

    fn write_tsv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(".tsv").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn raw_tsv_keeps_json_text_and_tolerates_missing_columns() {
        let file = write_tsv(
            "id\tjob_level\twork_experience\tbirth_year\tlinkedin_url_is_valid\n\
             1\tC-Team\t[{\"start_year\": 2010}]\t\ttrue\n\
             2\tStaff\t[]\t1980\tfalse\n",
        );
        let rows = read_raw_profiles(file.path()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].job_level.as_deref(), Some("C-Team"));
        assert_eq!(
            rows[0].work_experience.as_deref(),
            Some("[{\"start_year\": 2010}]")
        );
        assert_eq!(rows[0].birth_year, None);
        assert_eq!(rows[0].linkedin_url_is_valid.as_deref(), Some("true"));
        assert_eq!(rows[1].birth_year(), Some(1980));
        assert_eq!(rows[1].education, None);

        let sources = read_source_records(file.path()).unwrap();
        assert_eq!(sources[1].birth_year, Some(1980));
        assert_eq!(sources[0].approximate_age, None);
    }

    #[test]
    fn missing_id_column_is_a_schema_error() {
        let file = write_tsv("job_level\nStaff\n");
        match read_raw_profiles(file.path()) {
            Err(DataError::ColumnNotFound { column, .. }) => assert_eq!(column, "id"),
            other => panic!("expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn targets_skip_unusable_ages() {
        let file = write_tsv("id\tactual_age\n1\t41\n2\t\n3\t29.5\n");
        let targets = read_targets(file.path()).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[&IdentityKey(1)], 41.0);
        assert_eq!(targets[&IdentityKey(3)], 29.5);
    }

    #[test]
    fn features_round_trip_through_parquet() {
        let mut first = [0.0; FEATURE_COUNT];
        let mut second = [0.0; FEATURE_COUNT];
        for i in 0..FEATURE_COUNT {
            first[i] = i as f64;
            second[i] = -(i as f64) / 2.0;
        }
        let matrix = FeatureMatrix::from_rows(vec![
            (IdentityKey(10), FeatureVector(first)),
            (IdentityKey(20), FeatureVector(second)),
        ]);
        let dir = tempdir().unwrap();
        let path = dir.path().join("features.parquet");
        write_features(&path, &matrix, "2025-06-01T00:00:00Z", "v1.0_parsed").unwrap();
        let loaded = read_features(&path).unwrap();
        assert_eq!(loaded, matrix);
    }

    #[test]
    fn shard_files_are_named_listed_and_read() {
        assert_eq!(shard_file_name(7), "batch_0007.parquet");
        assert_eq!(parse_shard_file_name("batch_0897.parquet"), Some(897));
        assert_eq!(parse_shard_file_name("batch_x.parquet"), None);
        assert_eq!(parse_shard_file_name("part-00000.parquet"), None);

        let dir = tempdir().unwrap();
        let record = |id: i64, batch_id: u32| PredictionRecord {
            id: IdentityKey(id),
            predicted_age: 33,
            confidence: IntervalWidth(8.25),
            prediction_ts: "2025-06-01T00:00:00Z".to_string(),
            model_version: "v1.0_ridge".to_string(),
            batch_id,
            prediction_status: STATUS_HAS_PREDICTION.to_string(),
        };
        write_predictions(&dir.path().join(shard_file_name(2)), &[record(2, 2)]).unwrap();
        write_predictions(&dir.path().join(shard_file_name(0)), &[record(4, 0), record(8, 0)])
            .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let listed: Vec<u32> =
            list_shard_files(dir.path()).unwrap().into_iter().map(|(b, _)| b).collect();
        assert_eq!(listed, vec![0, 2]);
        let all = read_prediction_dir(dir.path(), 3).unwrap();
        assert_eq!(all, vec![record(4, 0), record(8, 0), record(2, 2)]);

        // A run with two shards never wrote batch 2.
        let current = read_prediction_dir(dir.path(), 2).unwrap();
        assert_eq!(current, vec![record(4, 0), record(8, 0)]);

        assert_eq!(clear_shard_outputs(dir.path()).unwrap(), 2);
        assert!(list_shard_files(dir.path()).unwrap().is_empty());
        assert!(dir.path().join("notes.txt").exists());
        assert_eq!(clear_shard_outputs(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn late_non_numeric_values_fall_back_per_row() {
        let mut contents = String::from("id\tbirth_year\tlinkedin_connection_count\n");
        for id in 1..=160 {
            let (birth_year, connections) = if id == 150 {
                ("unknown", "500+")
            } else {
                ("1980", "350")
            };
            contents.push_str(&format!("{id}\t{birth_year}\t{connections}\n"));
        }
        let file = write_tsv(&contents);

        let rows = read_raw_profiles(file.path()).unwrap();
        assert_eq!(rows.len(), 160);
        assert_eq!(rows[148].birth_year(), Some(1980));
        assert_eq!(rows[149].birth_year(), None);
        assert!(rows[149].needs_prediction());
        assert_eq!(rows[149].linkedin_connection_count.as_deref(), Some("500+"));

        let sources = read_source_records(file.path()).unwrap();
        assert_eq!(sources[149].birth_year, None);
        assert_eq!(sources[159].birth_year, Some(1980));
    }

    #[test]
    fn final_directory_is_replaced_wholesale() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("final");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("stale.parquet"), "old").unwrap();

        let records = vec![FinalResultRecord {
            id: IdentityKey(1),
            predicted_age: 35,
            confidence: Confidence::Quality(QualityPercent(15.0)),
            qa_timestamp: "2025-06-01T00:00:00Z".to_string(),
            model_version: "default_rule".to_string(),
            prediction_status: "INSUFFICIENT_DATA".to_string(),
            prediction_source: PredictionSource::DefaultRule,
        }];
        let path = write_final_results(&out, &records).unwrap();
        assert_eq!(path, out.join(FINAL_PART_FILE));
        let names: Vec<_> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![FINAL_PART_FILE.to_string()]);

        let df = ParquetReader::new(File::open(&path).unwrap()).finish().unwrap();
        assert_eq!(df.height(), 1);
        let source = df.column("prediction_source").unwrap().str().unwrap().get(0);
        assert_eq!(source, Some("DEFAULT_RULE"));
    }
}
