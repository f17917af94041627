use chrono::{NaiveDate, Utc};
use reu_core::text::{clean_description, clean_stipend, collapse_whitespace, derive_title, is_placeholder_title};
use reu_core::{
    Deadline, DeadlinePolicy, DeadlineRaw, FallbackCategory, FieldTaxonomy, NormalizedProgram, ProgramStatus, RawProgramRecord,
    SourceTag, DEFAULT_DURATION, DEFAULT_LOCATION, DEFAULT_REQUIREMENTS,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeSettings {
    pub default_deadline_year: i32,
    pub default_location: String,
    pub default_duration: String,
    pub default_requirements: String,
    pub default_status: ProgramStatus,
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self {
            default_deadline_year: DeadlinePolicy::default().default_year,
            default_location: DEFAULT_LOCATION.to_string(),
            default_duration: DEFAULT_DURATION.to_string(),
            default_requirements: DEFAULT_REQUIREMENTS.to_string(),
            default_status: ProgramStatus::default(),
        }
    }
}

impl NormalizeSettings {
    pub fn deadline_policy(&self) -> DeadlinePolicy {
        DeadlinePolicy {
            default_year: self.default_deadline_year,
            ..DeadlinePolicy::default()
        }
    }

    /// Parse a deadline as the pipeline would today, honoring `default_deadline_year`.
    pub fn parse_deadline(&self, raw: Option<&DeadlineRaw>, source: SourceTag) -> Deadline {
        self.deadline_policy().parse(raw, source, Utc::now().date_naive())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{origin} record has no title ({})", url.as_deref().unwrap_or("no url"))]
    MissingTitle { origin: SourceTag, url: Option<String> },
    #[error("{origin} record {title:?} has no institution")]
    MissingInstitution { origin: SourceTag, title: String },
}

#[derive(Debug, Default)]
pub struct NormalizeReport {
    pub programs: Vec<NormalizedProgram>,
    pub rejected: Vec<ValidationError>,
}

/// Raw record to canonical program: field classification, deadline parsing, cleanup and defaults.
#[derive(Debug, Clone)]
pub struct Normalizer {
    taxonomy: FieldTaxonomy,
    fallback: FallbackCategory,
    deadlines: DeadlinePolicy,
    settings: NormalizeSettings,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(FieldTaxonomy::default(), FallbackCategory::default(), NormalizeSettings::default())
    }
}

fn present(value: Option<&str>) -> Option<String> {
    value.map(collapse_whitespace).filter(|v| !v.is_empty())
}

impl Normalizer {
    pub fn new(taxonomy: FieldTaxonomy, fallback: FallbackCategory, settings: NormalizeSettings) -> Self {
        let deadlines = settings.deadline_policy();
        Self {
            taxonomy,
            fallback,
            deadlines,
            settings,
        }
    }

    pub fn normalize(&self, raw: &RawProgramRecord, today: NaiveDate) -> Result<NormalizedProgram, ValidationError> {
        let title = present(raw.title.as_deref()).ok_or_else(|| ValidationError::MissingTitle {
            origin: raw.source,
            url: raw.url.clone(),
        })?;
        let institution =
            present(raw.institution.as_deref()).ok_or_else(|| ValidationError::MissingInstitution {
                origin: raw.source,
                title: title.clone(),
            })?;

        let fields = self
            .taxonomy
            .standardize(&raw.field_text, Some(&raw.description), Some(&title), self.fallback);

        let title = if is_placeholder_title(&title) {
            let derived = derive_title(fields.first().map(String::as_str), &institution);
            debug!(source = %raw.source, original = %title, %derived, "replaced placeholder title");
            derived
        } else {
            title
        };

        Ok(NormalizedProgram {
            title,
            institution,
            location: present(raw.location.as_deref()).unwrap_or_else(|| self.settings.default_location.clone()),
            fields,
            description: clean_description(&raw.description),
            deadline: self.deadlines.parse(raw.deadline_raw.as_ref(), raw.source, today),
            stipend: clean_stipend(raw.stipend_raw.as_deref()),
            duration: present(raw.duration_raw.as_deref()).unwrap_or_else(|| self.settings.default_duration.clone()),
            requirements: present(raw.requirements_raw.as_deref())
                .unwrap_or_else(|| self.settings.default_requirements.clone()),
            link: raw.url.as_deref().map(str::trim).unwrap_or_default().to_string(),
            source: raw.source,
            status: self.settings.default_status,
        })
    }

    /// Normalize every record; invalid ones are collected instead of written.
    pub fn normalize_batch(&self, raws: &[RawProgramRecord], today: NaiveDate) -> NormalizeReport {
        let mut report = NormalizeReport::default();
        for raw in raws {
            match self.normalize(raw, today) {
                Ok(program) => report.programs.push(program),
                Err(err) => {
                    debug!(error = %err, "rejected raw record");
                    report.rejected.push(err);
                }
            }
        }
        report
    }
}
