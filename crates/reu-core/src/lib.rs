//! Core domain model for the REU program directory pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub mod deadline;
pub mod fields;
pub mod text;

pub use deadline::{parse_deadline, parse_deadline_on, DeadlinePolicy};
pub use fields::{standardize, FallbackCategory, FieldTaxonomy, TaxonomyError};

pub const CRATE_NAME: &str = "reu-core";

pub const UNKNOWN_DEADLINE: &str = "unknown";
pub const DEFAULT_LOCATION: &str = "Location not specified";
pub const DEFAULT_DURATION: &str = "10 weeks";
pub const DEFAULT_REQUIREMENTS: &str =
    "Open to undergraduate students. Check the program website for specific eligibility requirements.";
pub const PATHWAYS_DEADLINE_NOTICE: &str = "Check website for deadlines";

/// Closed set of places a program record can come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum SourceTag {
    #[serde(rename = "NSF")]
    Nsf,
    #[serde(rename = "GoogleSheets")]
    GoogleSheets,
    #[serde(rename = "PathwaysToScience")]
    PathwaysToScience,
    #[serde(rename = "ETAP")]
    Etap,
    #[default]
    #[serde(rename = "Manual")]
    Manual,
}

impl SourceTag {
    pub const ALL: [SourceTag; 5] = [
        SourceTag::Nsf,
        SourceTag::GoogleSheets,
        SourceTag::PathwaysToScience,
        SourceTag::Etap,
        SourceTag::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Nsf => "NSF",
            SourceTag::GoogleSheets => "GoogleSheets",
            SourceTag::PathwaysToScience => "PathwaysToScience",
            SourceTag::Etap => "ETAP",
            SourceTag::Manual => "Manual",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown source tag: {0}")]
pub struct UnknownSourceTag(pub String);

impl FromStr for SourceTag {
    type Err = UnknownSourceTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>();
        match key.as_str() {
            "nsf" => Ok(SourceTag::Nsf),
            "googlesheets" | "sheets" | "spreadsheet" => Ok(SourceTag::GoogleSheets),
            "pathwaystoscience" | "pathways" => Ok(SourceTag::PathwaysToScience),
            "etap" => Ok(SourceTag::Etap),
            "manual" => Ok(SourceTag::Manual),
            _ => Err(UnknownSourceTag(s.to_string())),
        }
    }
}

/// Unstructured research-field input: either one free-text string or a list of labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldInput {
    List(Vec<String>),
    Text(String),
}

impl Default for FieldInput {
    fn default() -> Self {
        FieldInput::Text(String::new())
    }
}

impl FieldInput {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldInput::Text(s) => s.trim().is_empty(),
            FieldInput::List(items) => items.iter().all(|s| s.trim().is_empty()),
        }
    }

    /// First non-empty label, used when deriving titles from raw field cells.
    pub fn first_label(&self) -> Option<String> {
        let first = match self {
            FieldInput::Text(s) => s.split([',', ';']).map(str::trim).find(|s| !s.is_empty()),
            FieldInput::List(items) => items.iter().map(|s| s.trim()).find(|s| !s.is_empty()),
        };
        first.map(ToString::to_string)
    }
}

/// Deadline as delivered by a source, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeadlineRaw {
    Date(NaiveDate),
    Text(String),
}

/// Extractor output. Shape is shared across sources but contents are unvalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RawProgramRecord {
    pub title: Option<String>,
    pub institution: Option<String>,
    pub location: Option<String>,
    pub field_text: FieldInput,
    pub description: String,
    pub deadline_raw: Option<DeadlineRaw>,
    pub stipend_raw: Option<String>,
    pub duration_raw: Option<String>,
    pub requirements_raw: Option<String>,
    pub url: Option<String>,
    pub source: SourceTag,
}

impl RawProgramRecord {
    pub fn new(source: SourceTag) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    /// Record for a page whose title or institution could not be determined.
    pub fn unusable(source: SourceTag, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            field_text: FieldInput::List(Vec::new()),
            source,
            ..Default::default()
        }
    }

    pub fn is_usable(&self) -> bool {
        self.title.as_deref().is_some_and(|t| !t.trim().is_empty())
            && self.institution.as_deref().is_some_and(|i| !i.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProgramStatus {
    Pending,
    Approved,
    Rejected,
    #[default]
    Active,
}

impl ProgramStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramStatus::Pending => "pending",
            ProgramStatus::Approved => "approved",
            ProgramStatus::Rejected => "rejected",
            ProgramStatus::Active => "active",
        }
    }
}

impl FromStr for ProgramStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ProgramStatus::Pending),
            "approved" => Ok(ProgramStatus::Approved),
            "rejected" => Ok(ProgramStatus::Rejected),
            "active" => Ok(ProgramStatus::Active),
            other => Err(format!("unknown program status: {other}")),
        }
    }
}

/// Normalized deadline. Never holds an out-of-range date.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Deadline {
    Date(NaiveDate),
    Unknown,
    /// Human-readable notice kept verbatim for sources whose deadlines are free text.
    Notice(String),
}

impl Deadline {
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Deadline::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn from_stored(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN_DEADLINE) {
            return Deadline::Unknown;
        }
        match NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            Ok(date) => Deadline::Date(date),
            Err(_) => Deadline::Notice(trimmed.to_string()),
        }
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deadline::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Deadline::Unknown => f.write_str(UNKNOWN_DEADLINE),
            Deadline::Notice(text) => f.write_str(text),
        }
    }
}

impl Serialize for Deadline {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Deadline {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Deadline::from_stored(&raw))
    }
}

/// Canonical program shape handed to the upsert step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedProgram {
    pub title: String,
    pub institution: String,
    pub location: String,
    pub fields: Vec<String>,
    pub description: String,
    pub deadline: Deadline,
    pub stipend: String,
    pub duration: String,
    pub requirements: String,
    pub link: String,
    pub source: SourceTag,
    pub status: ProgramStatus,
}

impl NormalizedProgram {
    /// Case-insensitive (title, institution) identity used for matching and in-batch dedup.
    pub fn identity_key(&self) -> (String, String) {
        (match_key(&self.title), match_key(&self.institution))
    }

    pub fn first_field(&self) -> Option<&str> {
        self.fields.first().map(String::as_str)
    }
}

/// Persisted program: a normalized payload plus identity and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredProgram {
    pub id: Uuid,
    #[serde(flatten)]
    pub program: NormalizedProgram,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredProgram {
    pub fn new(program: NormalizedProgram, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            program,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite every field except identity and creation time.
    pub fn overwrite(&mut self, program: NormalizedProgram, now: DateTime<Utc>) {
        self.program = program;
        self.updated_at = now;
    }
}

pub fn match_key(value: &str) -> String {
    value.trim().to_lowercase()
}
