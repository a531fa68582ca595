//! # Feature Encoder
//!
//! Maps categorical and free-text business fields onto fixed ordinal or
//! continuous scores. Each mapping is total: unrecognised values land in a
//! table-specific fallback bucket.
//!
//! Two table sets exist. The training features were produced with one set of
//! buckets and the serving path scores with another; both are reproduced
//! exactly and selected through [`FeatureEncodingProfile`].

use crate::features::parse::{self, days_between, is_present, parse_count, parse_timestamp};
use chrono::NaiveDateTime;

/// Which stage's lookup tables and thresholds to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureEncodingProfile {
    /// Tables used when the training feature set was parsed.
    Training,
    /// Tables used by the batch prediction workers.
    Serving,
}

/// Fallback when the profile text is absent or never parses as a date.
pub const DEFAULT_DAYS_SINCE_UPDATE: i64 = 365;

const TRAINING_DAYS_PER_MONTH: f64 = 30.44;
const SERVING_DAYS_PER_MONTH: f64 = 30.0;
const SERVING_MAX_TENURE_MONTHS: i64 = 600;
const SERVING_DEFAULT_TENURE_MONTHS: i64 = 36;

// --- Lookup tables ---
// Keys are matched exactly (case-sensitive), as the source values are controlled vocabularies.

const TRAINING_COMPENSATION: &[(&str, i64)] = &[
    ("$200,001+", 8),
    ("$150,001 - $200,000", 7),
    ("$100,001 - $150,000", 6),
    ("$75,001 - $100,000", 5),
    ("$50,001 - $75,000", 4),
    ("$25,001 - $50,000", 3),
];

const SERVING_COMPENSATION: &[(&str, i64)] = &[
    ("$0-25k", 1),
    ("$25-50k", 2),
    ("$50-75k", 3),
    ("$75-100k", 4),
    ("$100-150k", 5),
    ("$150-250k", 6),
    ("$250k+", 7),
];

const TRAINING_COMPANY_SIZE: &[(&str, i64)] = &[
    ("10000+", 9),
    ("5000 to 9999", 8),
    ("1000 to 4999", 7),
    ("500 to 999", 6),
    ("200 to 499", 5),
];

const SERVING_COMPANY_SIZE: &[(&str, i64)] = &[
    ("1-10", 1),
    ("11-50", 2),
    ("51-200", 3),
    ("201-500", 4),
    ("501-1000", 5),
    ("1001-5000", 6),
    ("5001-10000", 7),
    ("10000+", 8),
];

const TRAINING_REVENUE: &[(&str, i64)] = &[
    ("$1B+", 9),
    ("$500M to $1B", 8),
    ("$100M to $500M", 7),
];

const SERVING_REVENUE: &[(&str, i64)] = &[
    ("$0-1M", 1),
    ("$1-10M", 2),
    ("$10-50M", 3),
    ("$50-100M", 4),
    ("$100-500M", 5),
    ("$500M-1B", 6),
    ("$1B+", 7),
];

const TRAINING_INDUSTRY_AGE: &[(&str, i64)] = &[
    ("Technology", 35),
    ("Consulting", 38),
    ("Finance", 42),
    ("Healthcare", 45),
    ("Education", 48),
    ("Government", 50),
];

const SERVING_INDUSTRY_AGE: &[(&str, i64)] = &[
    ("Technology", 35),
    ("Consulting", 38),
    ("Finance", 42),
    ("Healthcare", 40),
    ("Education", 45),
    ("Retail", 32),
    ("Manufacturing", 43),
    ("Real Estate", 44),
];

const TRAINING_JOB_FUNCTION: &[(&str, i64)] = &[
    ("Engineering", 1),
    ("Sales", 2),
    ("Marketing", 3),
    ("Finance", 4),
    ("Operations", 5),
];

const SERVING_JOB_FUNCTION: &[(&str, i64)] = &[
    ("Engineering", 0),
    ("Sales", 1),
    ("Marketing", 2),
    ("Operations", 3),
    ("Finance", 4),
    ("HR", 5),
    ("Product", 6),
    ("Other", 7),
];

const JOB_LEVELS: &[(&str, i64)] = &[("C-Team", 4), ("Manager", 3), ("Staff", 2)];

/// A fixed string-keyed table with its fallback bucket.
#[derive(Debug, Clone, Copy)]
struct LookupTable {
    entries: &'static [(&'static str, i64)],
    fallback: i64,
}

impl LookupTable {
    fn encode(&self, value: Option<&str>) -> i64 {
        value
            .and_then(|v| self.entries.iter().find(|(key, _)| *key == v))
            .map_or(self.fallback, |(_, code)| *code)
    }
}

impl FeatureEncodingProfile {
    fn compensation_table(self) -> LookupTable {
        match self {
            Self::Training => LookupTable { entries: TRAINING_COMPENSATION, fallback: 4 },
            Self::Serving => LookupTable { entries: SERVING_COMPENSATION, fallback: 4 },
        }
    }

    fn company_size_table(self) -> LookupTable {
        match self {
            Self::Training => LookupTable { entries: TRAINING_COMPANY_SIZE, fallback: 4 },
            Self::Serving => LookupTable { entries: SERVING_COMPANY_SIZE, fallback: 5 },
        }
    }

    fn revenue_table(self) -> LookupTable {
        match self {
            Self::Training => LookupTable { entries: TRAINING_REVENUE, fallback: 5 },
            Self::Serving => LookupTable { entries: SERVING_REVENUE, fallback: 5 },
        }
    }

    fn industry_table(self) -> LookupTable {
        match self {
            Self::Training => LookupTable { entries: TRAINING_INDUSTRY_AGE, fallback: 40 },
            Self::Serving => LookupTable { entries: SERVING_INDUSTRY_AGE, fallback: 40 },
        }
    }

    fn job_function_table(self) -> LookupTable {
        match self {
            Self::Training => LookupTable { entries: TRAINING_JOB_FUNCTION, fallback: 0 },
            Self::Serving => LookupTable { entries: SERVING_JOB_FUNCTION, fallback: 7 },
        }
    }

    fn job_level_table(self) -> LookupTable {
        match self {
            Self::Training => LookupTable { entries: JOB_LEVELS, fallback: 1 },
            // Only C-Team and Manager are distinguished here; Staff shares the fallback.
            Self::Serving => LookupTable { entries: JOB_LEVELS, fallback: 2 },
        }
    }

    pub fn compensation(self, range: Option<&str>) -> i64 {
        self.compensation_table().encode(range)
    }

    pub fn company_size(self, range: Option<&str>) -> i64 {
        self.company_size_table().encode(range)
    }

    pub fn company_revenue(self, range: Option<&str>) -> i64 {
        self.revenue_table().encode(range)
    }

    pub fn industry_typical_age(self, industry: Option<&str>) -> i64 {
        self.industry_table().encode(industry)
    }

    pub fn job_function(self, function: Option<&str>) -> i64 {
        self.job_function_table().encode(function)
    }

    pub fn job_level(self, level: Option<&str>) -> i64 {
        self.job_level_table().encode(level)
    }

    /// Seniority from keywords in the job title, first match wins.
    ///
    /// Training order: chief/vp (5) > senior/principal (4) > manager/director (3)
    /// > associate/analyst (2) > junior/entry (1), otherwise 3.
    /// Serving order: chief/ceo/president (5) > vp/vice president (4)
    /// > manager/director (3), otherwise the job-level score.
    pub fn job_seniority(self, title: Option<&str>, job_level: Option<&str>) -> i64 {
        let lower = title.map(str::to_lowercase);
        let has = |needle: &str| lower.as_deref().is_some_and(|t| t.contains(needle));
        match self {
            Self::Training => {
                if lower.is_none() {
                    3
                } else if has("chief") || has("vp") {
                    5
                } else if has("senior") || has("principal") {
                    4
                } else if has("manager") || has("director") {
                    3
                } else if has("associate") || has("analyst") {
                    2
                } else if has("junior") || has("entry") {
                    1
                } else {
                    3
                }
            }
            Self::Serving => {
                if has("chief") || has("ceo") || has("president") {
                    5
                } else if has("vp") || has("vice president") {
                    4
                } else if has("manager") || has("director") {
                    3
                } else {
                    LookupTable { entries: JOB_LEVELS, fallback: 2 }.encode(job_level)
                }
            }
        }
    }

    /// Step function of the LinkedIn connection count.
    pub fn linkedin_activity(self, connections: Option<&str>) -> f64 {
        match self {
            Self::Training => {
                let count = match connections {
                    None => 0,
                    Some(text) => match parse_count(Some(text)) {
                        Some(count) => count,
                        None => return 0.3,
                    },
                };
                if count > 500 {
                    1.0
                } else if count > 200 {
                    0.8
                } else if count > 100 {
                    0.6
                } else {
                    0.3
                }
            }
            Self::Serving => {
                let count = parse_count(connections).unwrap_or(0);
                if count >= 500 {
                    1.0
                } else if count >= 100 {
                    0.7
                } else if count > 0 {
                    0.3
                } else {
                    0.0
                }
            }
        }
    }

    /// Months in the current role relative to the frozen run timestamp.
    ///
    /// A parseable start date always wins. Without one the training tables fall
    /// back on the job level (C-Team 120, Manager 60, otherwise 36) and the
    /// serving tables use a flat 36. Serving clamps to [0, 600].
    pub fn tenure_months(
        self,
        job_start_date: Option<&str>,
        job_level: Option<&str>,
        now: NaiveDateTime,
    ) -> i64 {
        let start = parse_timestamp(job_start_date);
        match self {
            Self::Training => match start {
                Some(start) => {
                    (days_between(start, now) as f64 / TRAINING_DAYS_PER_MONTH) as i64
                }
                None => match job_level {
                    Some("C-Team") => 120,
                    Some("Manager") => 60,
                    _ => 36,
                },
            },
            Self::Serving => match start {
                Some(start) => {
                    let months = (days_between(start, now) as f64 / SERVING_DAYS_PER_MONTH) as i64;
                    months.clamp(0, SERVING_MAX_TENURE_MONTHS)
                }
                None => SERVING_DEFAULT_TENURE_MONTHS,
            },
        }
    }
}

/// Days since the profile was last refreshed, or 365 when unknown.
pub fn days_since_update(ev_last_date: Option<&str>, now: NaiveDateTime) -> i64 {
    parse_timestamp(ev_last_date)
        .map_or(DEFAULT_DAYS_SINCE_UPDATE, |last| days_between(last, now))
}

/// Presence score across professional and social profiles.
///
/// | LinkedIn valid | Facebook / Twitter | score |
/// |---|---|---|
/// | yes | both | 1.0 |
/// | yes | one | 0.7 |
/// | yes | none | 0.5 |
/// | no | any | 0.2 |
pub fn social_media_presence(
    linkedin_url_is_valid: Option<&str>,
    facebook_url: Option<&str>,
    twitter_url: Option<&str>,
) -> f64 {
    let linkedin = linkedin_url_is_valid == Some("true");
    let facebook = is_present(facebook_url);
    let twitter = is_present(twitter_url);
    match (linkedin, facebook, twitter) {
        (true, true, true) => 1.0,
        (true, true, false) | (true, false, true) => 0.7,
        (true, false, false) => 0.5,
        (false, _, _) => 0.2,
    }
}

/// 1.0 with both work and personal email, 0.5 with one, 0.0 with none.
pub fn email_engagement(work_email: Option<&str>, personal_email: Option<&str>) -> f64 {
    match (is_present(work_email), is_present(personal_email)) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.5,
        (false, false) => 0.0,
    }
}

pub use parse::education_level;
