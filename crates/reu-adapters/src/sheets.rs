//! Google Sheets extractor with heuristic header and column discovery.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reu_core::text::{collapse_whitespace, derive_title, is_monetary, is_placeholder_title};
use reu_core::{DeadlineRaw, FieldInput, RawProgramRecord, SourceTag};
use reu_storage::{FetchRequest, HttpFetcher, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use url::Url;

use crate::{json_str, AdapterContext, AdapterError, ProgramExtractor};

const SOURCE_ID: &str = "GoogleSheets";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const HEADER_MARKERS: [&str; 4] = ["reu", "program", "institution", "deadline"];
const FALLBACK_HEADER_ROW: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpreadsheetConfig {
    pub enabled: bool,
    pub api_base: String,
    pub max_rows: usize,
    pub header_scan_rows: usize,
    pub header_scan_cols: usize,
    pub deadline_season: String,
    pub fallback_programs: Vec<RawProgramRecord>,
    #[serde(skip)]
    pub spreadsheet_id: Option<String>,
    #[serde(skip)]
    pub credentials_path: Option<PathBuf>,
}

impl Default for SpreadsheetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: "https://sheets.googleapis.com".to_string(),
            max_rows: 300,
            header_scan_rows: 10,
            header_scan_cols: 10,
            deadline_season: "Summer 2025".to_string(),
            fallback_programs: default_fallback_programs(),
            spreadsheet_id: None,
            credentials_path: None,
        }
    }
}

fn fallback_program(title: &str, institution: &str, location: &str, fields: &str, url: &str) -> RawProgramRecord {
    RawProgramRecord {
        title: Some(title.to_string()),
        institution: Some(institution.to_string()),
        location: Some(location.to_string()),
        field_text: FieldInput::Text(fields.to_string()),
        deadline_raw: Some(DeadlineRaw::Text("February 1, 2025".to_string())),
        url: Some(url.to_string()),
        ..RawProgramRecord::new(SourceTag::GoogleSheets)
    }
}

fn default_fallback_programs() -> Vec<RawProgramRecord> {
    vec![
        fallback_program(
            "Amgen Scholars Program",
            "Stanford University",
            "Stanford, CA",
            "Biology, Chemistry",
            "https://amgenscholars.com",
        ),
        fallback_program(
            "Summer Undergraduate Research Fellowships (SURF)",
            "California Institute of Technology",
            "Pasadena, CA",
            "Physics, Engineering, Computer Science",
            "https://sfp.caltech.edu/programs/surf",
        ),
        fallback_program(
            "Research Experiences for Undergraduates in Mathematics",
            "Tufts University",
            "Medford, MA",
            "Mathematics",
            "https://math.tufts.edu/reu",
        ),
    ]
}

/// A worksheet's cell grid, row-major, as formatted strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worksheet {
    pub title: String,
    pub row_count: usize,
    pub cells: Vec<Vec<String>>,
}

impl Worksheet {
    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.cells
            .get(row)
            .and_then(|r| r.get(col))
            .map(|s| s.trim())
            .unwrap_or("")
    }
}

#[async_trait]
pub trait WorksheetSource: Send + Sync {
    async fn first_worksheet(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        max_rows: usize,
    ) -> Result<Worksheet, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Clone)]
enum KeySource {
    File(PathBuf),
    Loaded(ServiceAccountKey),
}

/// Sheets v4 client authenticated with a service-account JWT grant.
#[derive(Debug, Clone)]
pub struct GoogleSheetsClient {
    spreadsheet_id: String,
    key: KeySource,
    api_base: String,
}

impl GoogleSheetsClient {
    pub fn from_key_file(spreadsheet_id: impl Into<String>, path: impl Into<PathBuf>, api_base: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            key: KeySource::File(path.into()),
            api_base: api_base.into(),
        }
    }

    pub fn with_key(spreadsheet_id: impl Into<String>, key: ServiceAccountKey, api_base: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            key: KeySource::Loaded(key),
            api_base: api_base.into(),
        }
    }

    async fn service_account_key(&self) -> Result<ServiceAccountKey, AdapterError> {
        match &self.key {
            KeySource::Loaded(key) => Ok(key.clone()),
            KeySource::File(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading service account key {}", path.display()))?;
                let key = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing service account key {}", path.display()))?;
                Ok(key)
            }
        }
    }

    async fn access_token(&self, http: &HttpFetcher) -> Result<String, AdapterError> {
        let key = self.service_account_key().await?;
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: SHEETS_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("loading service account private key")?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .context("signing service account jwt")?;

        let response = http
            .post_form(&key.token_uri, &[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())])
            .await?;
        let token: TokenResponse = response.json()?;
        Ok(token.access_token)
    }

    fn api_url(&self, segments: &[&str]) -> Result<Url, AdapterError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| AdapterError::Message(format!("invalid sheets api base {}: {e}", self.api_base)))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::Message(format!("sheets api base {} cannot take a path", self.api_base)))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.spreadsheet_id.as_str()])
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl WorksheetSource for GoogleSheetsClient {
    async fn first_worksheet(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        max_rows: usize,
    ) -> Result<Worksheet, AdapterError> {
        let token = self.access_token(http).await?;

        let metadata_url = self.api_url(&[])?;
        let metadata: JsonValue = http
            .fetch(
                ctx.run_id,
                SOURCE_ID,
                &FetchRequest::get(metadata_url.as_str())
                    .query("fields", "sheets.properties")
                    .bearer(Some(token.clone())),
                RetryPolicy::Once,
            )
            .await?
            .json()?;

        let first = metadata
            .pointer("/sheets/0/properties")
            .ok_or_else(|| AdapterError::Message("spreadsheet has no worksheets".to_string()))?;
        let title = json_str(first, &["title"]).unwrap_or_else(|| "Sheet1".to_string());
        let row_count = first
            .pointer("/gridProperties/rowCount")
            .and_then(JsonValue::as_u64)
            .map(|n| n as usize)
            .unwrap_or(max_rows);

        let last_row = max_rows.min(row_count).max(1);
        let range = format!("'{}'!A1:Z{last_row}", title.replace('\'', "''"));
        let values_url = self.api_url(&["values", range.as_str()])?;
        let values: JsonValue = http
            .fetch(
                ctx.run_id,
                SOURCE_ID,
                &FetchRequest::get(values_url.as_str()).bearer(Some(token)),
                RetryPolicy::Once,
            )
            .await?
            .json()?;

        let cells = values
            .get("values")
            .and_then(JsonValue::as_array)
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        row.as_array()
                            .map(|cols| cols.iter().map(cell_to_string).collect())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Worksheet {
            title,
            row_count,
            cells,
        })
    }
}

fn cell_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolved column index per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    pub name: usize,
    pub institution: usize,
    pub location: usize,
    pub field: usize,
    pub deadline: usize,
    pub description: usize,
    pub website: usize,
    pub stipend: usize,
}

struct ColumnRule {
    needles: &'static [&'static str],
    fallback: usize,
}

const NAME_RULE: ColumnRule = ColumnRule {
    needles: &["program name", "program title", "name of program", "program", "title", "reu"],
    fallback: 0,
};
const INSTITUTION_RULE: ColumnRule = ColumnRule {
    needles: &["institution", "university", "college", "host", "school"],
    fallback: 1,
};
const LOCATION_RULE: ColumnRule = ColumnRule {
    needles: &["location", "city", "state"],
    fallback: 2,
};
const FIELD_RULE: ColumnRule = ColumnRule {
    needles: &["field", "discipline", "subject", "research area", "topic"],
    fallback: 3,
};
const DEADLINE_FALLBACK: usize = 4;
const DESCRIPTION_RULE: ColumnRule = ColumnRule {
    needles: &["description", "summary", "about", "details"],
    fallback: 5,
};
const WEBSITE_RULE: ColumnRule = ColumnRule {
    needles: &["website", "url", "link", "web"],
    fallback: 6,
};
const STIPEND_RULE: ColumnRule = ColumnRule {
    needles: &["stipend", "compensation", "salary", "pay"],
    fallback: 7,
};

impl ColumnRule {
    fn resolve(&self, labels: &[String]) -> usize {
        self.needles
            .iter()
            .find_map(|needle| labels.iter().position(|label| label.contains(needle)))
            .unwrap_or(self.fallback)
    }
}

/// First row within the scan window holding a marker cell, else the forced fallback row.
pub fn find_header_row(sheet: &Worksheet, scan_rows: usize, scan_cols: usize) -> usize {
    (0..scan_rows.min(sheet.cells.len()))
        .find(|&row| {
            (0..scan_cols).any(|col| {
                let cell = sheet.cell(row, col).to_lowercase();
                HEADER_MARKERS.iter().any(|marker| cell.contains(marker))
            })
        })
        .unwrap_or(FALLBACK_HEADER_ROW)
}

pub fn resolve_columns(labels: &[String], deadline_season: &str) -> ColumnMap {
    let season = deadline_season.trim().to_lowercase();
    let exact = format!("{season} deadline");
    let deadline = labels
        .iter()
        .position(|l| *l == exact)
        .or_else(|| {
            labels
                .iter()
                .position(|l| !season.is_empty() && l.contains(&season) && l.contains("deadline"))
        })
        .or_else(|| {
            labels
                .iter()
                .position(|l| l.contains("deadline") || l.contains("due date"))
        })
        .unwrap_or(DEADLINE_FALLBACK);

    ColumnMap {
        name: NAME_RULE.resolve(labels),
        institution: INSTITUTION_RULE.resolve(labels),
        location: LOCATION_RULE.resolve(labels),
        field: FIELD_RULE.resolve(labels),
        deadline,
        description: DESCRIPTION_RULE.resolve(labels),
        website: WEBSITE_RULE.resolve(labels),
        stipend: STIPEND_RULE.resolve(labels),
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = collapse_whitespace(value);
    (!value.is_empty()).then_some(value)
}

/// Rows below the header become raw records. `None` when the grid is empty.
pub fn parse_worksheet(sheet: &Worksheet, config: &SpreadsheetConfig) -> Option<Vec<RawProgramRecord>> {
    if sheet.cells.is_empty() {
        return None;
    }

    let header_row = find_header_row(sheet, config.header_scan_rows, config.header_scan_cols);
    let labels = sheet
        .cells
        .get(header_row)
        .map(|row| row.iter().map(|l| collapse_whitespace(l).to_lowercase()).collect::<Vec<_>>())
        .unwrap_or_default();
    let columns = resolve_columns(&labels, &config.deadline_season);
    debug!(source = SOURCE_ID, header_row, ?columns, "resolved spreadsheet layout");

    let end = config.max_rows.min(sheet.row_count).min(sheet.cells.len());
    let mut records = Vec::new();
    for row in (header_row + 1)..end {
        let name = sheet.cell(row, columns.name);
        if name.is_empty() {
            continue;
        }

        let institution = sheet.cell(row, columns.institution);
        let field_text = FieldInput::Text(sheet.cell(row, columns.field).to_string());
        let title = if is_placeholder_title(name) {
            let derived = derive_title(field_text.first_label().as_deref(), institution);
            debug!(source = SOURCE_ID, row, original = name, %derived, "regenerated placeholder title");
            derived
        } else {
            collapse_whitespace(name)
        };
        let stipend = sheet.cell(row, columns.stipend);

        records.push(RawProgramRecord {
            title: Some(title),
            institution: non_empty(institution),
            location: non_empty(sheet.cell(row, columns.location)),
            field_text,
            description: sheet.cell(row, columns.description).to_string(),
            deadline_raw: non_empty(sheet.cell(row, columns.deadline)).map(DeadlineRaw::Text),
            stipend_raw: is_monetary(stipend).then(|| collapse_whitespace(stipend)),
            duration_raw: None,
            requirements_raw: None,
            url: non_empty(sheet.cell(row, columns.website)),
            source: SourceTag::GoogleSheets,
        });
    }
    Some(records)
}

pub struct SpreadsheetExtractor {
    config: SpreadsheetConfig,
    source: Option<Arc<dyn WorksheetSource>>,
}

impl SpreadsheetExtractor {
    /// Uses the Google Sheets client when both a spreadsheet id and a key file are configured.
    pub fn from_config(config: SpreadsheetConfig) -> Self {
        let source = match (&config.spreadsheet_id, &config.credentials_path) {
            (Some(id), Some(path)) => Some(Arc::new(GoogleSheetsClient::from_key_file(
                id.clone(),
                path.clone(),
                config.api_base.clone(),
            )) as Arc<dyn WorksheetSource>),
            _ => None,
        };
        Self { config, source }
    }

    pub fn with_source(config: SpreadsheetConfig, source: Arc<dyn WorksheetSource>) -> Self {
        Self {
            config,
            source: Some(source),
        }
    }

    fn fallback(&self) -> Vec<RawProgramRecord> {
        self.config
            .fallback_programs
            .iter()
            .cloned()
            .map(|mut record| {
                record.source = SourceTag::GoogleSheets;
                record
            })
            .collect()
    }
}

#[async_trait]
impl ProgramExtractor for SpreadsheetExtractor {
    fn source(&self) -> SourceTag {
        SourceTag::GoogleSheets
    }

    async fn extract(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawProgramRecord>, AdapterError> {
        let Some(source) = &self.source else {
            warn!(source = SOURCE_ID, "spreadsheet credentials not configured, using fallback programs");
            return Ok(self.fallback());
        };

        let sheet = match source.first_worksheet(http, ctx, self.config.max_rows).await {
            Ok(sheet) => sheet,
            Err(err) => {
                warn!(source = SOURCE_ID, error = %err, "spreadsheet load failed, using fallback programs");
                return Ok(self.fallback());
            }
        };

        match parse_worksheet(&sheet, &self.config) {
            Some(records) => {
                info!(source = SOURCE_ID, worksheet = %sheet.title, count = records.len(), "spreadsheet extraction complete");
                Ok(records)
            }
            None => {
                warn!(source = SOURCE_ID, worksheet = %sheet.title, "worksheet is empty, using fallback programs");
                Ok(self.fallback())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use reu_storage::HttpClientConfig;

    fn fixture_path(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sheets").join(name)
    }

    fn fixture_sheet() -> Worksheet {
        serde_json::from_str(&std::fs::read_to_string(fixture_path("programs.json")).unwrap()).unwrap()
    }

    struct StaticSheet(Worksheet);

    #[async_trait]
    impl WorksheetSource for StaticSheet {
        async fn first_worksheet(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
            _max_rows: usize,
        ) -> Result<Worksheet, AdapterError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSheet;

    #[async_trait]
    impl WorksheetSource for BrokenSheet {
        async fn first_worksheet(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
            _max_rows: usize,
        ) -> Result<Worksheet, AdapterError> {
            Err(AdapterError::Message("invalid_grant".into()))
        }
    }

    #[test]
    fn header_is_found_below_banner_rows() {
        let sheet = fixture_sheet();
        assert_eq!(find_header_row(&sheet, 10, 10), 2);
    }

    #[test]
    fn versioned_deadline_column_wins_over_generic() {
        let labels = ["program name", "host institution", "application deadline", "summer 2025 deadline"]
            .map(String::from);
        assert_eq!(resolve_columns(&labels, "Summer 2025").deadline, 3);

        let loose = ["program", "deadline (summer 2025)", "due date"].map(String::from);
        assert_eq!(resolve_columns(&loose, "Summer 2025").deadline, 1);

        let generic = ["program", "institution", "due date"].map(String::from);
        assert_eq!(resolve_columns(&generic, "Summer 2025").deadline, 2);

        let none = ["a", "b"].map(String::from);
        let columns = resolve_columns(&none, "Summer 2025");
        assert_eq!(columns.deadline, DEADLINE_FALLBACK);
        assert_eq!(columns.website, 6);
    }

    #[test]
    fn fixture_rows_become_records() {
        let records = parse_worksheet(&fixture_sheet(), &SpreadsheetConfig::default()).unwrap();
        assert_eq!(records.len(), 4);

        let reef = &records[0];
        assert_eq!(reef.title.as_deref(), Some("Coral Reef Ecology REU"));
        assert_eq!(reef.deadline_raw, Some(DeadlineRaw::Text("02/01/2025".into())));
        assert_eq!(reef.stipend_raw.as_deref(), Some("$6,500"));
        assert_eq!(reef.url.as_deref(), Some("https://hawaii.edu/reu"));

        let online = &records[1];
        assert_eq!(online.title.as_deref(), Some("Biology Research at Tufts"));
        assert_eq!(online.stipend_raw, None);

        assert!(records.iter().all(|r| r.institution.as_deref() != Some("Skipped University")));
    }

    #[test]
    fn rows_stop_at_the_configured_maximum() {
        let config = SpreadsheetConfig {
            max_rows: 7,
            ..Default::default()
        };
        let records = parse_worksheet(&fixture_sheet(), &config).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn missing_markers_force_the_fallback_header_and_indices() {
        let sheet = Worksheet {
            title: "Sheet1".into(),
            row_count: 4,
            cells: vec![
                vec!["Spring list".into()],
                vec!["Name".into(), "Where".into()],
                vec![
                    "Neuroscience Summer".into(),
                    "Brown University".into(),
                    "Providence, RI".into(),
                    "Neuroscience".into(),
                    "March 3, 2025".into(),
                    "Lab rotations".into(),
                    "https://brown.edu/neuro".into(),
                    "$5000".into(),
                ],
            ],
        };
        let records = parse_worksheet(&sheet, &SpreadsheetConfig::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].institution.as_deref(), Some("Brown University"));
        assert_eq!(records[0].deadline_raw, Some(DeadlineRaw::Text("March 3, 2025".into())));
        assert_eq!(records[0].stipend_raw.as_deref(), Some("$5000"));
    }

    #[tokio::test]
    async fn load_failure_returns_fallback_programs() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let extractor = SpreadsheetExtractor::with_source(SpreadsheetConfig::default(), Arc::new(BrokenSheet));
        let records = extractor.extract(&http, &AdapterContext::new()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.source == SourceTag::GoogleSheets));

        let unconfigured = SpreadsheetExtractor::from_config(SpreadsheetConfig::default());
        assert_eq!(unconfigured.extract(&http, &AdapterContext::new()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn static_source_is_parsed() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let extractor = SpreadsheetExtractor::with_source(
            SpreadsheetConfig::default(),
            Arc::new(StaticSheet(fixture_sheet())),
        );
        let records = extractor.extract(&http, &AdapterContext::new()).await.unwrap();
        assert_eq!(records.len(), 4);
    }

    #[tokio::test]
    async fn google_client_exchanges_jwt_and_reads_values() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), JWT_GRANT_TYPE.into()))
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.test","expires_in":3600,"token_type":"Bearer"}"#)
            .create_async()
            .await;
        let metadata = server
            .mock("GET", "/v4/spreadsheets/sheet-123")
            .match_query(Matcher::UrlEncoded("fields".into(), "sheets.properties".into()))
            .match_header("authorization", "Bearer ya29.test")
            .with_status(200)
            .with_body(r#"{"sheets":[{"properties":{"title":"Programs","gridProperties":{"rowCount":3}}}]}"#)
            .create_async()
            .await;
        let values = server
            .mock("GET", Matcher::Regex(r"^/v4/spreadsheets/sheet-123/values/".into()))
            .match_header("authorization", "Bearer ya29.test")
            .with_status(200)
            .with_body(r#"{"values":[["Program","Institution"],["Ocean REU","URI",2025]]}"#)
            .create_async()
            .await;

        let mut key: ServiceAccountKey =
            serde_json::from_str(&std::fs::read_to_string(fixture_path("service_account.json")).unwrap()).unwrap();
        key.token_uri = format!("{}/token", server.url());

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let client = GoogleSheetsClient::with_key("sheet-123", key, server.url());
        let sheet = client.first_worksheet(&http, &AdapterContext::new(), 300).await.unwrap();

        assert_eq!(sheet.title, "Programs");
        assert_eq!(sheet.row_count, 3);
        assert_eq!(sheet.cell(1, 0), "Ocean REU");
        assert_eq!(sheet.cell(1, 2), "2025");
        token.assert_async().await;
        metadata.assert_async().await;
        values.assert_async().await;
    }
}
