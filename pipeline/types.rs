// ========================================================================================
//
//                       CORE DATA TYPES FOR THE AGECAST ENGINE
//
// ========================================================================================
//
// This module is the canonical dictionary for data structures that cross the major
// architectural boundaries of the crate (`features`, `model`, `merge`, `batch`).
//
// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use chrono::{DateTime, Datelike, NaiveDateTime, SecondsFormat, Utc};
use std::fmt;

// ========================================================================================
//                                   IDENTITY
// ========================================================================================

/// The unique integer identifying one person record across every table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct IdentityKey(pub i64);

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ========================================================================================
//                                 RAW SOURCE ROWS
// ========================================================================================

/// One row of the source population. Every field except `id` may be absent or
/// malformed; nothing here is validated on construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawProfileRecord {
    pub id: i64,
    pub education: Option<String>,
    pub work_experience: Option<String>,
    pub skills: Option<String>,
    pub job_level: Option<String>,
    pub job_title: Option<String>,
    pub compensation_range: Option<String>,
    pub employee_range: Option<String>,
    pub industry: Option<String>,
    pub job_function: Option<String>,
    pub revenue_range: Option<String>,
    pub job_start_date: Option<String>,
    pub ev_last_date: Option<String>,
    pub linkedin_url_is_valid: Option<String>,
    pub linkedin_connection_count: Option<String>,
    pub work_email: Option<String>,
    pub personal_email: Option<String>,
    pub facebook_url: Option<String>,
    pub twitter_url: Option<String>,
    pub birth_year: Option<String>,
    pub approximate_age: Option<String>,
}

impl RawProfileRecord {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey(self.id)
    }

    /// The authoritative birth year, if the text holds a number.
    pub fn birth_year(&self) -> Option<i32> {
        lenient_integer(self.birth_year.as_deref())
    }

    /// The authoritative approximate age, if the text holds a number.
    pub fn approximate_age(&self) -> Option<i32> {
        lenient_integer(self.approximate_age.as_deref())
    }

    /// Records that already carry an authoritative age are never scored.
    pub fn needs_prediction(&self) -> bool {
        self.birth_year().is_none() && self.approximate_age().is_none()
    }
}

fn lenient_integer(text: Option<&str>) -> Option<i32> {
    let trimmed = text?.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = trimmed.parse::<i32>() {
        return Some(value);
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && value.abs() < i32::MAX as f64)
        .map(|value| value.round() as i32)
}

/// The authoritative slice of a source row that the merge stage needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRecord {
    pub id: IdentityKey,
    pub approximate_age: Option<i32>,
    pub birth_year: Option<i32>,
}

impl From<&RawProfileRecord> for SourceRecord {
    fn from(raw: &RawProfileRecord) -> Self {
        Self {
            id: raw.key(),
            approximate_age: raw.approximate_age(),
            birth_year: raw.birth_year(),
        }
    }
}

// ========================================================================================
//                               CONFIDENCE SCALES
// ========================================================================================

// Two scales coexist: the quantile interval width produced at inference time, where
// smaller means tighter, and the 0-100 quality percentage assigned by the merge stage,
// where larger means more certain. They are kept apart by type and only meet inside
// `Confidence`.

/// Width between the high and low quantile predictions, in years.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct IntervalWidth(pub f64);

/// A 0-100 certainty score assigned by the merge stage.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct QualityPercent(pub f64);

impl QualityPercent {
    pub const CERTAIN: QualityPercent = QualityPercent(100.0);
}

/// The confidence attached to a final record, tagged with the scale it was produced on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Confidence {
    Quality(QualityPercent),
    Interval(IntervalWidth),
}

impl Confidence {
    /// The raw number written to the `confidence_score` column.
    pub fn value(&self) -> f64 {
        match self {
            Confidence::Quality(q) => q.0,
            Confidence::Interval(w) => w.0,
        }
    }
}

// ========================================================================================
//                               PREDICTION RECORDS
// ========================================================================================

pub const STATUS_HAS_PREDICTION: &str = "HAS_PREDICTION";
pub const STATUS_EXISTING_AGE: &str = "EXISTING_AGE";
pub const STATUS_INSUFFICIENT_DATA: &str = "INSUFFICIENT_DATA";

/// One scored row as written by a shard worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub id: IdentityKey,
    pub predicted_age: i32,
    pub confidence: IntervalWidth,
    pub prediction_ts: String,
    pub model_version: String,
    pub batch_id: u32,
    pub prediction_status: String,
}

/// Provenance of the value in a final record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredictionSource {
    ExistingApproxAge,
    ExistingBirthYear,
    MlPrediction,
    DefaultRule,
}

impl PredictionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionSource::ExistingApproxAge => "EXISTING_APPROX_AGE",
            PredictionSource::ExistingBirthYear => "EXISTING_BIRTH_YEAR",
            PredictionSource::MlPrediction => "ML_PREDICTION",
            PredictionSource::DefaultRule => "DEFAULT_RULE",
        }
    }
}

impl fmt::Display for PredictionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the merged output table.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalResultRecord {
    pub id: IdentityKey,
    pub predicted_age: i32,
    pub confidence: Confidence,
    pub qa_timestamp: String,
    pub model_version: String,
    pub prediction_status: String,
    pub prediction_source: PredictionSource,
}

// ========================================================================================
//                                  RUN CONTEXT
// ========================================================================================

/// Values frozen once per pipeline run and threaded through every stage, so that
/// re-running a shard reproduces the same features.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunContext {
    pub run_timestamp: DateTime<Utc>,
    pub reference_year: i32,
}

impl RunContext {
    pub fn new(run_timestamp: DateTime<Utc>, reference_year: i32) -> Self {
        Self {
            run_timestamp,
            reference_year,
        }
    }

    pub fn naive_now(&self) -> NaiveDateTime {
        self.run_timestamp.naive_utc()
    }

    pub fn current_year(&self) -> i32 {
        self.run_timestamp.year()
    }

    /// Calendar quarter (1-4) of the run timestamp.
    pub fn quarter(&self) -> u32 {
        (self.run_timestamp.month() - 1) / 3 + 1
    }

    pub fn timestamp_string(&self) -> String {
        self.run_timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn authoritative_fields_parse_leniently() {
        let mut raw = RawProfileRecord::new(7);
        raw.birth_year = Some(" 1980 ".to_string());
        raw.approximate_age = Some("41.6".to_string());
        assert_eq!(raw.birth_year(), Some(1980));
        assert_eq!(raw.approximate_age(), Some(42));
        assert!(!raw.needs_prediction());

        raw.birth_year = Some("unknown".to_string());
        raw.approximate_age = Some(String::new());
        assert_eq!(raw.birth_year(), None);
        assert_eq!(raw.approximate_age(), None);
        assert!(raw.needs_prediction());
    }

    #[test]
    fn quarter_follows_the_frozen_timestamp() {
        let cases = [(1, 1), (3, 1), (4, 2), (6, 2), (7, 3), (9, 3), (10, 4), (12, 4)];
        for (month, expected) in cases {
            let ts = Utc.with_ymd_and_hms(2025, month, 15, 0, 0, 0).unwrap();
            assert_eq!(RunContext::new(ts, 2025).quarter(), expected, "month {month}");
        }
    }

    #[test]
    fn confidence_value_is_scale_tagged() {
        assert_eq!(Confidence::Quality(QualityPercent::CERTAIN).value(), 100.0);
        assert_eq!(Confidence::Interval(IntervalWidth(7.25)).value(), 7.25);
    }
}
