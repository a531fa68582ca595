use agecast::batch::{ScoringModels, await_shard_outputs, run_all_shards};
use agecast::config::RunConfig;
use agecast::features::{FEATURE_NAMES, FeatureEncodingProfile, assemble_all};
use agecast::merge::{ResolutionPolicy, guarantee_coverage};
use agecast::model::train::{join_targets, save_outcome, train_models};
use agecast::shared::files;
use agecast::types::PredictionSource;
use ahash::AHashSet;
use polars::prelude::*;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

const LEVELS: [&str; 5] = ["C-Team", "VP", "Director", "Manager", "Staff"];
const COMPENSATION: [&str; 4] = [
    "$50,001-$75,000",
    "$100,001-$150,000",
    "$150,001-$200,000",
    "$200,001+",
];

const HEADER: &str = "id\teducation\twork_experience\tskills\tjob_level\tjob_title\tcompensation_range\temployee_range\tjob_start_date\tbirth_year\tapproximate_age\n";

fn profile_line(id: i64, birth_year: &str, approximate_age: &str) -> String {
    let start = 1995 + (id % 25);
    let level = LEVELS[(id % 5) as usize];
    let compensation = COMPENSATION[(id % 4) as usize];
    format!(
        "{id}\t[{{\"degree\": \"Bachelors\", \"end_date\": {grad}}}]\t[{{\"start_year\": {start}, \"end_year\": {end}}}]\t[\"sql\", \"excel\"]\t{level}\t{level} of Operations\t{compensation}\t1001-5000\t{start}-06-01\t{birth_year}\t{approximate_age}\n",
        grad = start - 1,
        end = start + 3,
    )
}

fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn frozen_config(total_batches: u32) -> RunConfig {
    RunConfig {
        total_batches,
        run_timestamp: Some("2025-03-15T09:30:00Z".to_string()),
        ..RunConfig::default()
    }
}

#[test]
fn c_team_row_from_a_tab_separated_file() {
    let dir = tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "profiles.tsv",
        "id\teducation\twork_experience\tskills\tjob_level\tcompensation_range\temployee_range\n\
         1\t[]\t[]\t[]\tC-Team\t$200,001+\t10000+\n",
    );
    let config = frozen_config(1);
    let ctx = config.run_context().unwrap();
    let records = files::read_raw_profiles(&path).unwrap();
    let matrix = assemble_all(&records, FeatureEncodingProfile::Training, &ctx).unwrap();

    let value = |name: &str| {
        let index = FEATURE_NAMES.iter().position(|n| *n == name).unwrap();
        matrix.values[[0, index]]
    };
    assert_eq!(value("education_level_encoded"), 2.0);
    assert_eq!(value("number_of_jobs"), 1.0);
    assert_eq!(value("tenure_months"), 120.0);
    assert_eq!(value("compensation_encoded"), 8.0);
    assert_eq!(value("company_size_encoded"), 9.0);
}

#[test]
fn features_train_predict_merge_covers_every_record() {
    let dir = tempdir().unwrap();
    let config = frozen_config(4);
    let ctx = config.run_context().unwrap();

    // Training stage.
    let mut training = String::from(HEADER);
    let mut targets = String::from("id\tactual_age\n");
    for id in 1..=80 {
        training.push_str(&profile_line(id, "", ""));
        let age = if id % 10 == 0 {
            String::new()
        } else {
            (2025 - (1995 + (id % 25)) + 22).to_string()
        };
        writeln!(targets, "{id}\t{age}").unwrap();
    }
    let training_path = write_file(dir.path(), "training.tsv", &training);
    let targets_path = write_file(dir.path(), "targets.tsv", &targets);

    let records = files::read_raw_profiles(&training_path).unwrap();
    let matrix = assemble_all(&records, FeatureEncodingProfile::Training, &ctx).unwrap();
    let features_path = dir.path().join("training_features.parquet");
    files::write_features(&features_path, &matrix, "2025-03-15", &config.feature_version).unwrap();
    let features = files::read_features(&features_path).unwrap();
    assert_eq!(features.ids, matrix.ids);
    assert_eq!(features.values, matrix.values);

    let target_map = files::read_targets(&targets_path).unwrap();
    let rows = join_targets(&features, &target_map, config.training.max_training_rows);
    assert_eq!(rows.len(), 72);

    let outcome =
        train_models(&rows, &config.training, &config.model_version, "2025-03-15").unwrap();
    assert_eq!(outcome.report.point.validation_records, 15);
    let model_dir = dir.path().join("models");
    let saved = save_outcome(&outcome, &model_dir).unwrap();
    assert_eq!(saved.len(), 3);

    // Prediction stage over a population where some ages are already known.
    let mut population = String::from(HEADER);
    for id in 1..=30 {
        let birth_year = if id % 7 == 0 { "1970" } else { "" };
        let approximate_age = if id % 11 == 0 { "52" } else { "" };
        population.push_str(&profile_line(id, birth_year, approximate_age));
    }
    // A repeated row collapses into its first occurrence at merge time.
    population.push_str(&profile_line(3, "", ""));
    let population_path = write_file(dir.path(), "population.tsv", &population);
    let population_records = files::read_raw_profiles(&population_path).unwrap();

    let models = ScoringModels::load(&model_dir).unwrap();
    let predictions_dir = dir.path().join("predictions");
    let summary = run_all_shards(
        &population_records,
        config.total_batches,
        &models,
        &ctx,
        &predictions_dir,
    )
    .unwrap();
    assert!(summary.failures.is_empty());
    assert_eq!(summary.reports.len(), 4);

    let shard_paths = await_shard_outputs(
        &predictions_dir,
        config.total_batches,
        Some(SystemTime::from(ctx.run_timestamp)),
        Duration::ZERO,
        Duration::from_millis(10),
    )
    .unwrap();
    assert_eq!(shard_paths.len(), 4);

    let predictions = files::read_prediction_dir(&predictions_dir, config.total_batches).unwrap();
    for p in &predictions {
        assert!((18..=75).contains(&p.predicted_age));
        assert!(p.confidence.0.is_finite());
        assert_eq!(p.prediction_ts, "2025-03-15T09:30:00Z");
        assert_eq!(i64::from(p.batch_id), p.id.0 % 4);
    }

    // Merge stage.
    let sources = files::read_source_records(&population_path).unwrap();
    let policy = ResolutionPolicy::from_config(&config);
    let (merged, report) =
        guarantee_coverage(&sources, &predictions, &policy, &ctx.timestamp_string()).unwrap();
    assert_eq!(merged.len(), 30);
    assert_eq!(report.source_rows, 31);
    assert_eq!(report.existing_approx_age, 2);
    assert_eq!(report.existing_birth_year, 4);
    assert_eq!(report.ml_prediction, 24);
    assert_eq!(report.default_rule, 0);

    let by_birth = merged.iter().find(|r| r.id.0 == 7).unwrap();
    assert_eq!(by_birth.prediction_source, PredictionSource::ExistingBirthYear);
    assert_eq!(by_birth.predicted_age, 55);
    assert_eq!(by_birth.confidence.value(), 100.0);

    let output_dir = dir.path().join("final_results");
    fs::create_dir_all(&output_dir).unwrap();
    fs::write(output_dir.join("stale.parquet"), b"old").unwrap();
    let part = files::write_final_results(&output_dir, &merged).unwrap();
    assert!(!output_dir.join("stale.parquet").exists());

    let df = ParquetReader::new(File::open(&part).unwrap()).finish().unwrap();
    assert_eq!(df.height(), 30);
    let ids: AHashSet<i64> = df
        .column("id")
        .unwrap()
        .i64()
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(ids.len(), 30);
    let sources_column = df.column("prediction_source").unwrap().str().unwrap();
    assert_eq!(
        sources_column
            .into_iter()
            .filter(|s| *s == Some("ML_PREDICTION"))
            .count(),
        24
    );
}

#[test]
fn merge_without_predictions_falls_back_to_the_default_rule() {
    let dir = tempdir().unwrap();
    let population = format!(
        "{HEADER}{}{}{}",
        profile_line(1, "", ""),
        profile_line(2, "1990", ""),
        profile_line(3, "", "")
    );
    let path = write_file(dir.path(), "population.tsv", &population);
    let sources = files::read_source_records(&path).unwrap();
    let predictions = files::read_prediction_dir(&dir.path().join("missing"), 1).unwrap();
    assert!(predictions.is_empty());

    let (merged, report) = guarantee_coverage(
        &sources,
        &predictions,
        &ResolutionPolicy::default(),
        "2025-03-15T09:30:00Z",
    )
    .unwrap();
    assert_eq!(merged.len(), 3);
    assert_eq!(report.default_rule, 2);
    assert_eq!(merged[1].prediction_source, PredictionSource::ExistingBirthYear);
    assert_eq!(merged[2].predicted_age, 35);
    assert_eq!(merged[0].confidence.value(), 15.0);
}
