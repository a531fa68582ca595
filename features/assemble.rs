//! # Feature Vector Assembler
//!
//! Turns one raw profile row into the fixed-order numeric vector consumed by
//! the regressors, including the derived career metrics and interaction
//! terms. The column order in [`FEATURE_NAMES`] is the contract shared with
//! the trained model artifacts.

use crate::features::encode::{
    FeatureEncodingProfile, days_since_update, email_engagement, social_media_presence,
};
use crate::features::parse::{
    DefaultPolicy, array_length, career_years_from_jobs, education_level, graduation_year,
};
use crate::types::{IdentityKey, RawProfileRecord, RunContext};
use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use thiserror::Error;

pub const FEATURE_COUNT: usize = 21;

/// Canonical column order. Position `i` of every [`FeatureVector`] holds `FEATURE_NAMES[i]`.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "tenure_months",
    "job_level_encoded",
    "job_seniority_score",
    "compensation_encoded",
    "company_size_encoded",
    "linkedin_activity_score",
    "days_since_profile_update",
    "social_media_presence_score",
    "email_engagement_score",
    "industry_typical_age",
    "job_function_encoded",
    "company_revenue_encoded",
    "quarter",
    "education_level_encoded",
    "graduation_year",
    "number_of_jobs",
    "skill_count",
    "total_career_years",
    "job_churn_rate",
    "tenure_job_level_interaction",
    "comp_size_interaction",
];

const TRAINING_JOBS_DEFAULT: f64 = 1.0;
const TRAINING_SKILLS_DEFAULT: f64 = 5.0;
const TRAINING_CHURN_FALLBACK: f64 = 0.2;
const SERVING_CHURN_FALLBACK: f64 = 0.3;
const SERVING_GRADUATION_FALLBACK: f64 = 2010.0;
const SERVING_YEARS_PER_JOB: f64 = 3.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("Feature '{feature}' for id {id} is not finite ({value})")]
    NonFinite {
        id: IdentityKey,
        feature: &'static str,
        value: f64,
    },
}

/// A complete, finite feature row in canonical order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; FEATURE_COUNT]);

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|candidate| *candidate == name)
            .map(|index| self.0[index])
    }

    pub fn view(&self) -> ArrayView1<'_, f64> {
        ArrayView1::from(&self.0[..])
    }
}

/// A feature row paired with the observed age it should predict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingRow {
    pub id: IdentityKey,
    pub features: FeatureVector,
    pub target: f64,
}

/// Row-major stack of feature vectors with their identity keys alongside.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    pub ids: Vec<IdentityKey>,
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn from_rows(rows: Vec<(IdentityKey, FeatureVector)>) -> Self {
        let mut ids = Vec::with_capacity(rows.len());
        let mut flat = Vec::with_capacity(rows.len() * FEATURE_COUNT);
        for (id, vector) in rows {
            ids.push(id);
            flat.extend_from_slice(&vector.0);
        }
        let values = Array2::from_shape_vec((ids.len(), FEATURE_COUNT), flat)
            .expect("every row contributes FEATURE_COUNT values");
        Self { ids, values }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Builds the feature vector for one row under the given profile.
pub fn assemble(
    raw: &RawProfileRecord,
    profile: FeatureEncodingProfile,
    ctx: &RunContext,
) -> Result<FeatureVector, AssemblyError> {
    let now = ctx.naive_now();
    let job_level = raw.job_level.as_deref();

    let tenure = profile.tenure_months(raw.job_start_date.as_deref(), job_level, now) as f64;
    let level = profile.job_level(job_level) as f64;
    let seniority = profile.job_seniority(raw.job_title.as_deref(), job_level) as f64;
    let compensation = profile.compensation(raw.compensation_range.as_deref()) as f64;
    let company_size = profile.company_size(raw.employee_range.as_deref()) as f64;
    let graduation = graduation_year(raw.education.as_deref());

    let derived = match profile {
        FeatureEncodingProfile::Training => {
            let jobs = array_length(
                raw.work_experience.as_deref(),
                DefaultPolicy::Constant(TRAINING_JOBS_DEFAULT),
            );
            let skills = array_length(
                raw.skills.as_deref(),
                DefaultPolicy::Constant(TRAINING_SKILLS_DEFAULT),
            );
            let career_years = match graduation {
                // In f64 so that no year, however implausible, can overflow.
                Some(year) => (f64::from(ctx.reference_year) - f64::from(year)).max(1.0),
                None => (tenure / 12.0).max(1.0),
            };
            let churn = jobs / career_years;
            let churn = if churn.is_finite() {
                churn
            } else {
                TRAINING_CHURN_FALLBACK
            };
            CareerMetrics {
                graduation: graduation.map_or(0.0, f64::from),
                jobs,
                skills,
                career_years,
                churn,
            }
        }
        FeatureEncodingProfile::Serving => {
            let jobs = array_length(raw.work_experience.as_deref(), DefaultPolicy::Zero);
            let skills = array_length(raw.skills.as_deref(), DefaultPolicy::Zero);
            let career_years =
                career_years_from_jobs(raw.work_experience.as_deref(), ctx.current_year())
                    .unwrap_or(jobs * SERVING_YEARS_PER_JOB);
            let churn = if career_years > 0.0 {
                jobs / career_years
            } else {
                SERVING_CHURN_FALLBACK
            };
            CareerMetrics {
                graduation: graduation.map_or(SERVING_GRADUATION_FALLBACK, f64::from),
                jobs,
                skills,
                career_years,
                churn,
            }
        }
    };

    let values = [
        tenure,
        level,
        seniority,
        compensation,
        company_size,
        profile.linkedin_activity(raw.linkedin_connection_count.as_deref()),
        days_since_update(raw.ev_last_date.as_deref(), now) as f64,
        social_media_presence(
            raw.linkedin_url_is_valid.as_deref(),
            raw.facebook_url.as_deref(),
            raw.twitter_url.as_deref(),
        ),
        email_engagement(raw.work_email.as_deref(), raw.personal_email.as_deref()),
        profile.industry_typical_age(raw.industry.as_deref()) as f64,
        profile.job_function(raw.job_function.as_deref()) as f64,
        profile.company_revenue(raw.revenue_range.as_deref()) as f64,
        f64::from(ctx.quarter()),
        f64::from(education_level(raw.education.as_deref())),
        derived.graduation,
        derived.jobs,
        derived.skills,
        derived.career_years,
        derived.churn,
        tenure * level,
        compensation * company_size,
    ];

    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(AssemblyError::NonFinite {
            id: raw.key(),
            feature: FEATURE_NAMES[index],
            value: values[index],
        });
    }
    Ok(FeatureVector(values))
}

struct CareerMetrics {
    graduation: f64,
    jobs: f64,
    skills: f64,
    career_years: f64,
    churn: f64,
}

/// Assembles every row in parallel. Output order follows input order.
pub fn assemble_all<'a, I>(
    records: I,
    profile: FeatureEncodingProfile,
    ctx: &RunContext,
) -> Result<FeatureMatrix, AssemblyError>
where
    I: IntoParallelIterator<Item = &'a RawProfileRecord>,
    I::Iter: IndexedParallelIterator,
{
    let rows = records
        .into_par_iter()
        .map(|raw| assemble(raw, profile, ctx).map(|vector| (raw.key(), vector)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FeatureMatrix::from_rows(rows))
}
