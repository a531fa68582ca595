//! # Priority Resolver
//!
//! Picks one answer per identity key from the authoritative age fields, the
//! machine prediction and the population default, in that order. This is
//! also where the inference-time interval width meets the 0-100 quality
//! scale: authoritative and default answers are stamped with a
//! [`QualityPercent`], predictions keep their [`IntervalWidth`].

use crate::config::RunConfig;
use crate::types::{
    Confidence, FinalResultRecord, PredictionRecord, PredictionSource, QualityPercent,
    STATUS_EXISTING_AGE, STATUS_INSUFFICIENT_DATA, SourceRecord,
};

pub const VERSION_EXISTING_APPROX_AGE: &str = "existing_approx_age";
pub const VERSION_EXISTING_BIRTH_YEAR: &str = "existing_birth_year";
pub const VERSION_DEFAULT_RULE: &str = "default_rule";

/// The constants the resolver needs, lifted out of the run configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionPolicy {
    pub reference_year: i32,
    pub default_age: i32,
    pub default_confidence: QualityPercent,
}

impl ResolutionPolicy {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            reference_year: config.reference_year,
            default_age: config.default_age,
            default_confidence: QualityPercent(config.default_confidence),
        }
    }
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self::from_config(&RunConfig::default())
    }
}

/// Resolves the final record for one source row.
pub fn resolve(
    source: &SourceRecord,
    prediction: Option<&PredictionRecord>,
    policy: &ResolutionPolicy,
    qa_timestamp: &str,
) -> FinalResultRecord {
    let record = |age: i32,
                  confidence: Confidence,
                  version: &str,
                  status: &str,
                  origin: PredictionSource| FinalResultRecord {
        id: source.id,
        predicted_age: age,
        confidence,
        qa_timestamp: qa_timestamp.to_string(),
        model_version: version.to_string(),
        prediction_status: status.to_string(),
        prediction_source: origin,
    };

    if let Some(age) = source.approximate_age {
        return record(
            age,
            Confidence::Quality(QualityPercent::CERTAIN),
            VERSION_EXISTING_APPROX_AGE,
            STATUS_EXISTING_AGE,
            PredictionSource::ExistingApproxAge,
        );
    }
    // A birth year whose age does not fit in an i32 is treated as absent.
    if let Some(age) = source
        .birth_year
        .and_then(|year| policy.reference_year.checked_sub(year))
    {
        return record(
            age,
            Confidence::Quality(QualityPercent::CERTAIN),
            VERSION_EXISTING_BIRTH_YEAR,
            STATUS_EXISTING_AGE,
            PredictionSource::ExistingBirthYear,
        );
    }
    if let Some(p) = prediction {
        return record(
            p.predicted_age,
            Confidence::Interval(p.confidence),
            p.model_version.as_str(),
            p.prediction_status.as_str(),
            PredictionSource::MlPrediction,
        );
    }
    record(
        policy.default_age,
        Confidence::Quality(policy.default_confidence),
        VERSION_DEFAULT_RULE,
        STATUS_INSUFFICIENT_DATA,
        PredictionSource::DefaultRule,
    )
}
