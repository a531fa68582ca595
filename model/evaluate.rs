//! # Validation Metrics
//!
//! Error and accuracy summaries of an estimator on the held-out split.

use log::info;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Validation-split summary for one estimator. Values are rounded for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub model_name: String,
    pub model_version: String,
    pub validation_records: usize,
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
    pub accuracy_within_3_years: f64,
    pub accuracy_within_5_years: f64,
    pub accuracy_within_10_years: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_interval_width: Option<f64>,
    pub evaluation_date: String,
}

/// Both estimators' metrics, written next to the model artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub point: RegressionMetrics,
    pub quantile: RegressionMetrics,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round_ties_even() / factor
}

/// Computes MAE, RMSE, R² and within-N-years accuracy (as percentages).
///
/// An empty validation set yields zeros; a constant target yields R² = 0.
pub fn evaluate(
    model_name: &str,
    model_version: &str,
    evaluation_date: &str,
    actual: ArrayView1<f64>,
    predicted: ArrayView1<f64>,
) -> RegressionMetrics {
    let n = actual.len().min(predicted.len());
    let errors: Vec<f64> = actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| a - p)
        .collect();

    let (mae, rmse, r2, within) = if n == 0 {
        (0.0, 0.0, 0.0, [0.0; 3])
    } else {
        let count = n as f64;
        let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / count;
        let sse: f64 = errors.iter().map(|e| e * e).sum();
        let mean = actual.iter().take(n).sum::<f64>() / count;
        let sst: f64 = actual.iter().take(n).map(|a| (a - mean).powi(2)).sum();
        let r2 = if sst > 0.0 { 1.0 - sse / sst } else { 0.0 };
        let within = [3.0, 5.0, 10.0].map(|limit| {
            errors.iter().filter(|e| e.abs() <= limit).count() as f64 / count * 100.0
        });
        (mae, (sse / count).sqrt(), r2, within)
    };

    info!("{model_name} metrics - MAE: {mae:.2} years, RMSE: {rmse:.2} years, R²: {r2:.3}");
    info!("  Accuracy within 5 years: {:.1}%", within[1]);

    RegressionMetrics {
        model_name: model_name.to_string(),
        model_version: model_version.to_string(),
        validation_records: n,
        mae: round_to(mae, 2),
        rmse: round_to(rmse, 2),
        r2: round_to(r2, 3),
        accuracy_within_3_years: round_to(within[0], 1),
        accuracy_within_5_years: round_to(within[1], 1),
        accuracy_within_10_years: round_to(within[2], 1),
        avg_interval_width: None,
        evaluation_date: evaluation_date.to_string(),
    }
}

/// Mean of `high - low`, unrounded.
pub fn average_interval_width(low: ArrayView1<f64>, high: ArrayView1<f64>) -> f64 {
    if low.is_empty() {
        return 0.0;
    }
    (&high - &low).mean().unwrap_or(0.0)
}
