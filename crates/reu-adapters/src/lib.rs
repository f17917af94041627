//! Source extractor contract plus one extractor per REU program source.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reu_core::{RawProgramRecord, SourceTag};
use reu_storage::{retry_after_secs, BackoffPolicy, FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod manual;
pub mod nsf;
pub mod pathways;
pub mod sheets;

pub use manual::{ManualConfig, ManualExtractor};
pub use nsf::{NsfConfig, NsfExtractor};
pub use pathways::{PathwaysConfig, PathwaysExtractor};
pub use sheets::{GoogleSheetsClient, SpreadsheetConfig, SpreadsheetExtractor, Worksheet, WorksheetSource};

pub const CRATE_NAME: &str = "reu-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("rate limited by {url} (retry after {})", retry_after.as_deref().unwrap_or("unspecified"))]
    RateLimited {
        url: String,
        retry_after: Option<String>,
    },
    #[error(transparent)]
    Fetch(FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            AdapterError::RateLimited {
                retry_after: Some(value),
                ..
            } => retry_after_secs(value),
            _ => None,
        }
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited { url, retry_after } => AdapterError::RateLimited { url, retry_after },
            other => AdapterError::Fetch(other),
        }
    }
}

/// One program source. Implementations absorb per-record and per-page failures themselves.
#[async_trait]
pub trait ProgramExtractor: Send + Sync {
    fn source(&self) -> SourceTag;

    async fn extract(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawProgramRecord>, AdapterError>;
}

/// Retry/backoff knobs as they appear in `sources.yaml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl BackoffSettings {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Per-source extractor settings, one section each.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorSettings {
    pub nsf: NsfConfig,
    pub spreadsheet: SpreadsheetConfig,
    pub pathways: PathwaysConfig,
    pub manual: ManualConfig,
}

impl ExtractorSettings {
    pub fn is_enabled(&self, source: SourceTag) -> bool {
        match source {
            SourceTag::Nsf => self.nsf.enabled,
            SourceTag::GoogleSheets => self.spreadsheet.enabled,
            SourceTag::PathwaysToScience => self.pathways.enabled,
            SourceTag::Manual => self.manual.enabled,
            SourceTag::Etap => false,
        }
    }
}

/// Registered extractor for a source, or `None` when the source has no implementation.
pub fn extractor_for_source(
    source: SourceTag,
    settings: &ExtractorSettings,
) -> Option<Box<dyn ProgramExtractor>> {
    match source {
        SourceTag::Nsf => Some(Box::new(NsfExtractor::new(settings.nsf.clone()))),
        SourceTag::GoogleSheets => Some(Box::new(SpreadsheetExtractor::from_config(
            settings.spreadsheet.clone(),
        ))),
        SourceTag::PathwaysToScience => {
            Some(Box::new(PathwaysExtractor::new(settings.pathways.clone())))
        }
        SourceTag::Manual => Some(Box::new(ManualExtractor::new(settings.manual.clone()))),
        SourceTag::Etap => None,
    }
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let collapsed = reu_core::text::collapse_whitespace(value.as_ref());
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

pub(crate) fn select_first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .find_map(|n| text_or_none(element_text(n)))
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub(crate) fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Flatten a string, number, list of strings, or list/object of `{text|name|longName}` into texts.
pub(crate) fn json_texts(value: &JsonValue, path: &[&str]) -> Vec<String> {
    fn collect(value: &JsonValue, out: &mut Vec<String>) {
        match value {
            JsonValue::String(s) => out.extend(text_or_none(s)),
            JsonValue::Number(n) => out.push(n.to_string()),
            JsonValue::Array(items) => items.iter().for_each(|item| collect(item, out)),
            JsonValue::Object(map) => {
                if let Some(inner) = ["longName", "name", "text", "title"]
                    .iter()
                    .find_map(|key| map.get(*key))
                {
                    collect(inner, out);
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    if let Some(found) = json_at(value, path) {
        collect(found, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_texts_flattens_mixed_shapes() {
        let value = json!({
            "award": {
                "programElement": [{"code": "1139", "text": "RSCH EXPER FOR UNDERGRAD SITES"}],
                "directorate": {"abbreviation": "BIO", "longName": "Directorate for Biological Sciences"},
                "fieldOfStudy": ["Ecology", "  "],
                "id": 2244556
            }
        });
        assert_eq!(
            json_texts(&value, &["award", "programElement"]),
            vec!["RSCH EXPER FOR UNDERGRAD SITES"]
        );
        assert_eq!(
            json_texts(&value, &["award", "directorate"]),
            vec!["Directorate for Biological Sciences"]
        );
        assert_eq!(json_texts(&value, &["award", "fieldOfStudy"]), vec!["Ecology"]);
        assert_eq!(json_str(&value, &["award", "id"]).as_deref(), Some("2244556"));
        assert!(json_texts(&value, &["award", "missing"]).is_empty());
    }

    #[test]
    fn rate_limits_keep_their_retry_hint() {
        let err: AdapterError = FetchError::RateLimited {
            url: "https://example.org".into(),
            retry_after: Some("30".into()),
        }
        .into();
        assert_eq!(err.retry_after_secs(), Some(30));
        assert!(err.to_string().contains("retry after 30"));
    }

    #[test]
    fn etap_has_no_registered_extractor() {
        let settings = ExtractorSettings::default();
        assert!(extractor_for_source(SourceTag::Etap, &settings).is_none());
        for tag in [
            SourceTag::Nsf,
            SourceTag::GoogleSheets,
            SourceTag::PathwaysToScience,
            SourceTag::Manual,
        ] {
            let extractor = extractor_for_source(tag, &settings).expect("registered");
            assert_eq!(extractor.source(), tag);
        }
    }
}
