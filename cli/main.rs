#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, SystemTime};

use agecast::batch::{
    ScoringModels, ShardSpec, await_shard_outputs, list_batch_ids, pre_run_cleanup,
    run_all_shards, run_shard,
};
use agecast::config::RunConfig;
use agecast::features::{FeatureEncodingProfile, assemble_all};
use agecast::merge::{ResolutionPolicy, guarantee_coverage};
use agecast::model::train::{join_targets, save_outcome, train_models};
use agecast::shared::files;
use agecast::types::RunContext;

#[derive(Args)]
pub struct FeaturesArgs {
    /// Raw training profiles (Parquet or tab-separated text) with an `id` column
    #[arg(value_name = "PROFILES")]
    pub profiles: PathBuf,

    /// Where to write the feature table
    #[arg(long, default_value = "training_features.parquet")]
    pub output: PathBuf,
}

#[derive(Args)]
pub struct TrainArgs {
    /// Feature table written by `agecast features`
    #[arg(value_name = "FEATURES")]
    pub features: PathBuf,

    /// Observed ages, with `id` and `actual_age` columns
    #[arg(long, value_name = "PATH")]
    pub targets: PathBuf,

    /// Directory for the model artifacts and the metrics report
    #[arg(long, default_value = "models")]
    pub model_dir: PathBuf,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Source population (Parquet or tab-separated text)
    #[arg(value_name = "PROFILES")]
    pub profiles: PathBuf,

    /// Directory holding the model artifacts written by `agecast train`
    #[arg(long, default_value = "models")]
    pub model_dir: PathBuf,

    /// Directory the shard files are written to
    #[arg(long, default_value = "predictions")]
    pub output_dir: PathBuf,

    /// Score only this shard
    #[arg(long, env = "BATCH_ID", conflicts_with = "all", required_unless_present = "all")]
    pub batch_id: Option<u32>,

    /// Score every shard in this process
    #[arg(long)]
    pub all: bool,

    /// Number of shards; overrides the configuration file
    #[arg(long, env = "TOTAL_BATCHES")]
    pub total_batches: Option<u32>,
}

#[derive(Args)]
pub struct MergeArgs {
    /// Source population (Parquet or tab-separated text)
    #[arg(value_name = "PROFILES")]
    pub profiles: PathBuf,

    /// Directory holding the shard files
    #[arg(long, default_value = "predictions")]
    pub predictions_dir: PathBuf,

    /// Output directory; its previous contents are replaced
    #[arg(long, default_value = "final_results")]
    pub output_dir: PathBuf,

    /// Wait for every shard file before merging
    #[arg(long)]
    pub wait: bool,

    /// Number of shards to wait for; overrides the configuration file
    #[arg(long, env = "TOTAL_BATCHES")]
    pub total_batches: Option<u32>,
}

#[derive(Args)]
pub struct CleanArgs {
    /// Directory whose shard files are deleted
    #[arg(long, default_value = "predictions")]
    pub predictions_dir: PathBuf,

    /// Final output directory, removed entirely
    #[arg(long, default_value = "final_results")]
    pub output_dir: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "agecast",
    about = "Batch age estimation from professional profile data",
    long_about = "Derives features from profile records, trains point and interval \
                 estimators, scores the population in disjoint shards and merges the \
                 predictions with known ages into one table covering every record."
)]
struct Cli {
    /// TOML run configuration; every field is optional
    #[arg(long, global = true, value_name = "PATH", env = "AGECAST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build training features from raw profiles
    #[command(about = "Build training features (outputs: training_features.parquet)")]
    Features(FeaturesArgs),

    /// Fit the point and quantile estimators
    #[command(about = "Train the age estimators (outputs: models/)")]
    Train(TrainArgs),

    /// Print every batch id of a run, one per line
    #[command(about = "List the shard ids of a run")]
    Batches {
        /// Number of shards; overrides the configuration file
        #[arg(long, env = "TOTAL_BATCHES")]
        total_batches: Option<u32>,
    },

    /// Remove the outputs of an earlier run
    #[command(about = "Delete earlier shard files and final results before a new run")]
    Clean(CleanArgs),

    /// Score one shard or all shards of the population
    #[command(about = "Score the population (outputs: predictions/batch_NNNN.parquet)")]
    Predict(PredictArgs),

    /// Merge predictions with known ages for every record
    #[command(about = "Merge predictions with known ages (outputs: final_results/)")]
    Merge(MergeArgs),

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn load_config(
    path: Option<&Path>,
    total_batches: Option<u32>,
) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let mut config = RunConfig::load(path)?;
    if let Some(total) = total_batches {
        config.total_batches = total;
        config.validate()?;
    }
    Ok(config)
}

fn run_date(ctx: &RunContext) -> String {
    ctx.run_timestamp.format("%Y-%m-%d").to_string()
}

fn run_features(config: &RunConfig, args: FeaturesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = config.run_context()?;
    let records = files::read_raw_profiles(&args.profiles)?;
    info!("Assembling training features for {} profiles", records.len());
    let matrix = assemble_all(&records, FeatureEncodingProfile::Training, &ctx)?;
    files::write_features(&args.output, &matrix, &run_date(&ctx), &config.feature_version)?;
    println!("Features for {} profiles saved to: {}", matrix.len(), args.output.display());
    Ok(())
}

fn run_train(config: &RunConfig, args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = config.run_context()?;
    let features = files::read_features(&args.features)?;
    let targets = files::read_targets(&args.targets)?;
    let rows = join_targets(&features, &targets, config.training.max_training_rows);
    info!("{} of {} feature rows have an observed age", rows.len(), features.len());

    let outcome = train_models(&rows, &config.training, &config.model_version, &run_date(&ctx))?;
    let point = &outcome.report.point;
    println!(
        "Point estimator: MAE {:.2}, RMSE {:.2}, R² {:.3}, within 5 years {:.1}%",
        point.mae, point.rmse, point.r2, point.accuracy_within_5_years
    );
    if let Some(width) = outcome.report.quantile.avg_interval_width {
        println!("Average interval width: {width:.2} years");
    }
    for path in save_outcome(&outcome, &args.model_dir)? {
        println!("Saved: {}", path.display());
    }
    Ok(())
}

fn run_predict(config: &RunConfig, args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = config.run_context()?;
    let models = ScoringModels::load(&args.model_dir)?;
    let records = files::read_raw_profiles(&args.profiles)?;

    if args.all {
        let summary =
            run_all_shards(&records, config.total_batches, &models, &ctx, &args.output_dir)?;
        println!(
            "{} of {} shards completed, {} predictions written to {}",
            summary.reports.len(),
            config.total_batches,
            summary.rows_processed(),
            args.output_dir.display()
        );
        if summary.failures.is_empty() {
            return Ok(());
        }
        for failure in &summary.failures {
            let shard = failure
                .batch_id()
                .map_or_else(|| "-".to_string(), |id| id.to_string());
            eprintln!("Shard {shard} failed at {}: {failure}", failure.stage());
        }
        return Err(format!("{} shards failed", summary.failures.len()).into());
    }

    let batch_id = args
        .batch_id
        .ok_or("either --batch-id or --all must be given")?;
    let spec = ShardSpec::new(batch_id, config.total_batches)?;
    info!("Starting batch {batch_id} of {}", config.total_batches);
    let report = run_shard(spec, &records, &models, &ctx, &args.output_dir)?;
    println!(
        "Batch {} wrote {} predictions to {} in {:.2}s",
        report.batch_id,
        report.rows_processed,
        report.output_path.display(),
        report.elapsed_secs
    );
    Ok(())
}

fn run_merge(config: &RunConfig, args: MergeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = config.run_context()?;
    if args.wait {
        // Only a configured timestamp is shared with the shard processes; one read
        // from the clock here would postdate every shard file.
        let not_before = config
            .run_timestamp
            .is_some()
            .then(|| SystemTime::from(ctx.run_timestamp));
        await_shard_outputs(
            &args.predictions_dir,
            config.total_batches,
            not_before,
            Duration::from_secs(config.shard_wait_timeout_secs),
            Duration::from_secs(config.shard_poll_interval_secs.max(1)),
        )?;
    } else {
        let present = files::list_shard_files(&args.predictions_dir)?
            .into_iter()
            .filter(|(batch_id, _)| *batch_id < config.total_batches)
            .count();
        if present < config.total_batches as usize {
            warn!(
                "Only {present} of {} shard files are present; \
                 unscored records fall back to the default",
                config.total_batches
            );
        }
    }

    let sources = files::read_source_records(&args.profiles)?;
    let predictions = files::read_prediction_dir(&args.predictions_dir, config.total_batches)?;
    let policy = ResolutionPolicy::from_config(config);
    let (records, report) =
        guarantee_coverage(&sources, &predictions, &policy, &ctx.timestamp_string())?;
    let path = files::write_final_results(&args.output_dir, &records)?;
    println!(
        "{} records written to {} ({} predicted, {} from known ages, {} default)",
        records.len(),
        path.display(),
        report.ml_prediction,
        report.existing_approx_age + report.existing_birth_year,
        report.default_rule
    );
    Ok(())
}

fn run_clean(args: CleanArgs) -> Result<(), Box<dyn std::error::Error>> {
    let report = pre_run_cleanup(&args.predictions_dir, &args.output_dir)?;
    println!(
        "Removed {} shard files from {} and {} entries from {}",
        report.shard_files_removed,
        args.predictions_dir.display(),
        report.final_entries_removed,
        args.output_dir.display()
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { config, command } = Cli::parse();
    let config_path = config.as_deref();

    let result = match command {
        Some(Commands::Features(args)) => {
            load_config(config_path, None).and_then(|config| run_features(&config, args))
        }
        Some(Commands::Train(args)) => {
            load_config(config_path, None).and_then(|config| run_train(&config, args))
        }
        Some(Commands::Batches { total_batches }) => {
            load_config(config_path, total_batches).map(|config| {
                for batch_id in list_batch_ids(config.total_batches) {
                    println!("{batch_id}");
                }
            })
        }
        Some(Commands::Clean(args)) => run_clean(args),
        Some(Commands::Predict(args)) => load_config(config_path, args.total_batches)
            .and_then(|config| run_predict(&config, args)),
        Some(Commands::Merge(args)) => load_config(config_path, args.total_batches)
            .and_then(|config| run_merge(&config, args)),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("AGECAST_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("agecast {version}");

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
