//! # Field Parser
//!
//! Lenient readers for the semi-structured text fields of a profile row
//! (education history, work history, skills, dates, counts). Every function
//! is total: empty text, the literal `"[]"`, truncated JSON and JSON of the
//! wrong shape all resolve to a documented fallback instead of an error.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

/// Fallback for array-length queries whose input could not be counted.
///
/// The two pipeline stages disagree on this value, so it is chosen at each
/// call site rather than fixed here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultPolicy {
    Zero,
    Constant(f64),
}

impl DefaultPolicy {
    pub fn value(self) -> f64 {
        match self {
            DefaultPolicy::Zero => 0.0,
            DefaultPolicy::Constant(c) => c,
        }
    }
}

/// Education level fallback when nothing recognisable is present.
pub const DEFAULT_EDUCATION_LEVEL: u8 = 2;

/// True for absent, empty, or literally empty-array text.
pub fn is_blank(text: Option<&str>) -> bool {
    match text {
        None => true,
        Some(t) => t.is_empty() || t == "[]",
    }
}

fn parse_array(text: Option<&str>) -> Option<Vec<Value>> {
    if is_blank(text) {
        return None;
    }
    match serde_json::from_str::<Value>(text?) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

/// Ordinal education level from a keyword scan over the lowercased text.
///
/// The scan is deliberately shape-agnostic: it works on malformed JSON just as
/// well as on a valid array.
pub fn education_level(text: Option<&str>) -> u8 {
    if is_blank(text) {
        return DEFAULT_EDUCATION_LEVEL;
    }
    let lower = text.unwrap_or_default().to_lowercase();
    if lower.contains("phd") || lower.contains("doctorate") {
        5
    } else if lower.contains("master") || lower.contains("mba") {
        4
    } else if lower.contains("bachelor") {
        3
    } else if lower.contains("associate") {
        2
    } else if lower.contains("high school") {
        1
    } else {
        DEFAULT_EDUCATION_LEVEL
    }
}

/// The `end_date` of the first education entry, as a year.
pub fn graduation_year(text: Option<&str>) -> Option<i32> {
    let items = parse_array(text)?;
    let first = items.first()?.as_object()?;
    let year = integral(first.get("end_date")?)?;
    if year == 0 {
        return None;
    }
    i32::try_from(year).ok()
}

/// Number of elements in a JSON array, or the policy default.
pub fn array_length(text: Option<&str>, default_policy: DefaultPolicy) -> f64 {
    match parse_array(text) {
        Some(items) => items.len() as f64,
        None => default_policy.value(),
    }
}

/// Total years across job entries: the sum of `end_year - start_year` over
/// entries with a non-zero numeric `start_year`. A missing `end_year` counts
/// up to `current_year`. Entries whose `start_year` is missing or empty
/// (`null`, `0`, `false`, `""`, `[]`, `{}`) are skipped.
///
/// Returns `None` when nothing could be summed, or when any entry is not an
/// object or carries a non-numeric year.
pub fn career_years_from_jobs(text: Option<&str>, current_year: i32) -> Option<f64> {
    let items = parse_array(text)?;
    if items.is_empty() {
        return None;
    }
    let mut spans = Vec::with_capacity(items.len());
    for item in &items {
        let job = item.as_object()?;
        let start = match job.get("start_year") {
            Some(value) if !is_empty_value(value) => value.as_f64()?,
            _ => continue,
        };
        let end = match job.get("end_year") {
            None => f64::from(current_year),
            Some(value) => value.as_f64()?,
        };
        spans.push(end - start);
    }
    if spans.is_empty() {
        None
    } else {
        Some(spans.iter().sum())
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}

/// Reads a JSON value as an integer year: integers, integral floats, or integer text.
fn integral(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

/// Parses the date-like formats seen in profile data. Bare dates resolve to midnight.
pub fn parse_timestamp(text: Option<&str>) -> Option<NaiveDateTime> {
    let trimmed = text?.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt);
        }
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    // Year-month and bare-year forms have no day component for chrono to parse.
    let mut parts = trimmed.splitn(2, '-');
    let year = parts.next()?.parse::<i32>().ok()?;
    if !(1000..=9999).contains(&year) {
        return None;
    }
    let month = match parts.next() {
        Some(m) => m.parse::<u32>().ok()?,
        None => 1,
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// Whole days from `earlier` to `now`, floored like a calendar difference.
pub fn days_between(earlier: NaiveDateTime, now: NaiveDateTime) -> i64 {
    (now - earlier).num_seconds().div_euclid(86_400)
}

/// Integer count from integer or decimal text; decimals are truncated.
pub fn parse_count(text: Option<&str>) -> Option<i64> {
    let trimmed = text?.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(value);
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .map(|value| value.trunc() as i64)
}

/// True when an optional contact field carries any text.
pub fn is_present(text: Option<&str>) -> bool {
    text.is_some_and(|t| !t.is_empty())
}
