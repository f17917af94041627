//! NSF award-opportunity search client.

use async_trait::async_trait;
use reu_core::{DeadlineRaw, FieldInput, RawProgramRecord, SourceTag, DEFAULT_DURATION, DEFAULT_REQUIREMENTS};
use reu_storage::{FetchRequest, HttpFetcher, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{json_str, json_texts, AdapterContext, AdapterError, BackoffSettings, ProgramExtractor};

const SOURCE_ID: &str = "NSF";

/// Paths searched, in order, for research-field hints.
const FIELD_PATHS: [&[&str]; 7] = [
    &["opportunity", "topics"],
    &["award", "fieldOfStudy"],
    &["award", "programElement"],
    &["award", "programReference"],
    &["award", "directorate"],
    &["award", "division"],
    &["award", "fundProgramName"],
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NsfConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub search_term: String,
    pub default_deadline: String,
    pub default_stipend: String,
    pub default_duration: String,
    pub default_requirements: String,
    /// `{id}` is replaced by the award id when an opportunity carries no URL.
    pub award_url_template: String,
    pub backoff: BackoffSettings,
    #[serde(skip)]
    pub api_token: Option<String>,
    #[serde(skip)]
    pub user_id: Option<String>,
}

impl Default for NsfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://api.nsf.gov/services/v1/opportunities".to_string(),
            search_term: "Research Experiences for Undergraduates".to_string(),
            default_deadline: "February 1, 2025".to_string(),
            default_stipend: "$6,000 for the summer".to_string(),
            default_duration: DEFAULT_DURATION.to_string(),
            default_requirements: DEFAULT_REQUIREMENTS.to_string(),
            award_url_template: "https://www.nsf.gov/awardsearch/showAward?AWD_ID={id}".to_string(),
            backoff: BackoffSettings::default(),
            api_token: None,
            user_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NsfExtractor {
    config: NsfConfig,
}

impl NsfExtractor {
    pub fn new(config: NsfConfig) -> Self {
        Self { config }
    }

    fn request(&self) -> FetchRequest {
        let mut request = FetchRequest::get(&self.config.endpoint)
            .query("s", &self.config.search_term)
            .header("accept", "application/json")
            .bearer(self.config.api_token.clone());
        if let Some(user_id) = &self.config.user_id {
            request = request.query("userId", user_id);
        }
        request
    }
}

#[async_trait]
impl ProgramExtractor for NsfExtractor {
    fn source(&self) -> SourceTag {
        SourceTag::Nsf
    }

    /// Never fails: exhausted retries and undecodable bodies produce an empty list.
    async fn extract(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawProgramRecord>, AdapterError> {
        let policy = RetryPolicy::AnyFailure(self.config.backoff.policy());
        let response = match http.fetch(ctx.run_id, SOURCE_ID, &self.request(), policy).await {
            Ok(response) => response,
            Err(err) => {
                warn!(source = SOURCE_ID, error = %err, "nsf search failed after retries");
                return Ok(Vec::new());
            }
        };

        let body: JsonValue = match response.json() {
            Ok(body) => body,
            Err(err) => {
                warn!(source = SOURCE_ID, error = %err, "nsf response was not valid json");
                return Ok(Vec::new());
            }
        };

        let records = parse_opportunities(&body, &self.config);
        info!(source = SOURCE_ID, count = records.len(), "nsf extraction complete");
        Ok(records)
    }
}

/// Map `{response: {body: [{award, opportunity}]}}` into raw records, skipping incomplete entries.
pub fn parse_opportunities(body: &JsonValue, config: &NsfConfig) -> Vec<RawProgramRecord> {
    let Some(items) = body.pointer("/response/body").and_then(JsonValue::as_array) else {
        warn!(source = SOURCE_ID, "nsf response has no opportunity list");
        return Vec::new();
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let record = map_opportunity(item, config);
            if record.is_none() {
                warn!(source = SOURCE_ID, index = idx, "skipping opportunity without title, institution or url");
            }
            record
        })
        .collect()
}

fn map_opportunity(item: &JsonValue, config: &NsfConfig) -> Option<RawProgramRecord> {
    let title = json_str(item, &["award", "title"]).or_else(|| json_str(item, &["opportunity", "title"]))?;
    let institution = json_str(item, &["award", "awardeeName"])
        .or_else(|| json_str(item, &["award", "institution"]))?;
    let url = json_str(item, &["opportunity", "url"])
        .or_else(|| json_str(item, &["award", "url"]))
        .or_else(|| {
            json_str(item, &["award", "id"]).map(|id| config.award_url_template.replace("{id}", &id))
        })?;
    debug!(source = SOURCE_ID, %title, %institution, "processing opportunity");

    let city = json_str(item, &["award", "awardeeCity"]);
    let state = json_str(item, &["award", "awardeeStateCode"]);
    let location = match (city, state) {
        (Some(city), Some(state)) => format!("{city}, {state}"),
        (Some(single), None) | (None, Some(single)) => single,
        (None, None) => institution.clone(),
    };

    let field_candidates = FIELD_PATHS
        .iter()
        .flat_map(|path| json_texts(item, path))
        .collect::<Vec<_>>();

    let description = json_str(item, &["opportunity", "description"])
        .or_else(|| json_str(item, &["award", "abstractText"]))
        .unwrap_or_default();

    let deadline = json_str(item, &["opportunity", "endDate"]).unwrap_or_else(|| config.default_deadline.clone());

    Some(RawProgramRecord {
        title: Some(title),
        institution: Some(institution),
        location: Some(location),
        field_text: FieldInput::Text(field_candidates.join(", ")),
        description,
        deadline_raw: Some(DeadlineRaw::Text(deadline)),
        stipend_raw: Some(config.default_stipend.clone()),
        duration_raw: Some(config.default_duration.clone()),
        requirements_raw: Some(config.default_requirements.clone()),
        url: Some(url),
        source: SourceTag::Nsf,
    })
}
