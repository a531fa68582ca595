//! # Run Configuration
//!
//! Every business constant that the batch pipeline depends on (reference year,
//! shard count, default age, model version, training hyper-parameters) lives
//! here rather than being baked into the logic. The configuration is a TOML
//! file whose every field is optional; missing fields take the defaults below.

use crate::types::RunContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid run timestamp '{value}': {source}")]
    InvalidTimestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Year used to turn a birth year into an age and a graduation year into career years.
    pub reference_year: i32,
    /// Number of disjoint shards the population is split into.
    pub total_batches: u32,
    pub default_age: i32,
    pub default_confidence: f64,
    pub model_version: String,
    pub feature_version: String,
    /// RFC 3339 timestamp to freeze the run at. Captured from the clock once when absent.
    pub run_timestamp: Option<String>,
    pub shard_wait_timeout_secs: u64,
    pub shard_poll_interval_secs: u64,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub ridge_alpha: f64,
    pub quantile_low: f64,
    pub quantile_high: f64,
    pub validation_fraction: f64,
    pub split_seed: u64,
    pub max_training_rows: usize,
    pub quantile_max_iterations: usize,
    pub quantile_tolerance: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            reference_year: 2025,
            total_batches: 898,
            default_age: 35,
            default_confidence: 15.0,
            model_version: "v1.0_ridge".to_string(),
            feature_version: "v1.0_parsed".to_string(),
            run_timestamp: None,
            shard_wait_timeout_secs: 900,
            shard_poll_interval_secs: 5,
            training: TrainingConfig::default(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            ridge_alpha: 1.0,
            quantile_low: 0.1,
            quantile_high: 0.9,
            validation_fraction: 0.2,
            split_seed: 42,
            max_training_rows: 1_000_000,
            quantile_max_iterations: 100,
            quantile_tolerance: 1e-6,
        }
    }
}

impl RunConfig {
    /// Loads a configuration file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)?;
                toml::from_str(&text)?
            }
            None => RunConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_batches == 0 {
            return Err(ConfigError::Invalid(
                "total_batches must be at least 1".to_string(),
            ));
        }
        let t = &self.training;
        let in_unit = |q: f64| q > 0.0 && q < 1.0;
        if !in_unit(t.quantile_low)
            || !in_unit(t.quantile_high)
            || t.quantile_low >= t.quantile_high
        {
            return Err(ConfigError::Invalid(format!(
                "quantiles must satisfy 0 < low < high < 1 (got {} and {})",
                t.quantile_low, t.quantile_high
            )));
        }
        if !in_unit(t.validation_fraction) {
            return Err(ConfigError::Invalid(format!(
                "validation_fraction must lie in (0, 1), got {}",
                t.validation_fraction
            )));
        }
        if t.ridge_alpha < 0.0 || !t.ridge_alpha.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "ridge_alpha must be a non-negative number, got {}",
                t.ridge_alpha
            )));
        }
        Ok(())
    }

    /// Freezes the run timestamp. Called exactly once per process; every stage
    /// receives the returned context instead of reading the clock.
    pub fn run_context(&self) -> Result<RunContext, ConfigError> {
        let timestamp = match &self.run_timestamp {
            Some(text) => DateTime::parse_from_rfc3339(text)
                .map_err(|source| ConfigError::InvalidTimestamp {
                    value: text.clone(),
                    source,
                })?
                .with_timezone(&Utc),
            None => Utc::now(),
        };
        Ok(RunContext::new(timestamp, self.reference_year))
    }
}
