//! Pathways to Science listing crawler and program-page parser.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reu_core::text::{clean_description, collapse_whitespace, strip_contact_details};
use reu_core::{DeadlineRaw, FieldInput, RawProgramRecord, SourceTag};
use reu_storage::{FetchRequest, HttpFetcher, RetryPolicy};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::{element_text, select_first_text, text_or_none, AdapterContext, AdapterError, ProgramExtractor};

const SOURCE_ID: &str = "PathwaysToScience";

const DESCRIPTION_LABEL: &str = "Description:";
const DEADLINE_LABEL: &str = "Application Deadline:";
const INSTITUTION_LABEL: &str = "Participating Institution(s):";
const KEYWORDS_LABEL: &str = "Keywords:";
const DISCIPLINES_LABEL: &str = "Academic Disciplines:";
const LOCATION_LABEL: &str = "Location:";
const STIPEND_LABEL: &str = "Stipend:";

static PROGRAM_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)programhub\.aspx\?[^"'\s<>]*?\bsid=(\d+)"#).expect("valid program id regex")
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));
static BLOCK_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<\s*(?:br|/p|/div|/li)\s*/?>").expect("valid block break regex"));
static LABEL_ANCHORS: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("strong, b, dt, th, h2, h3, h4, h5, label, span.label").expect("valid label selector")
});
static LABEL_PATTERNS: Lazy<HashMap<&'static str, Regex>> = Lazy::new(|| {
    [
        DESCRIPTION_LABEL,
        DEADLINE_LABEL,
        INSTITUTION_LABEL,
        KEYWORDS_LABEL,
        DISCIPLINES_LABEL,
        LOCATION_LABEL,
        STIPEND_LABEL,
    ]
    .into_iter()
    .map(|label| {
        let pattern = format!(
            r"(?is){}\s*(?:</[a-z0-9]+>\s*)*(.*?)(?:<(?:strong|b|dt|th|h[1-6])\b|</(?:p|li|div|dd|td|section|article|body)>|$)",
            regex::escape(label)
        );
        (label, Regex::new(&pattern).expect("valid label pattern"))
    })
    .collect()
});
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").expect("valid h1 selector"));
static DOC_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").expect("valid title selector"));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathwaysConfig {
    pub enabled: bool,
    pub listing_url: String,
    pub link_selector: String,
    pub alternate_link_selectors: Vec<String>,
    /// `{sid}` is replaced by the program id found in raw listing HTML.
    pub detail_url_template: String,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub request_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for PathwaysConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listing_url: "https://www.pathwaystoscience.org/programs.aspx?u=Undergrads_Undergraduate%20Students&sort=PRG-Programs&adv=adv".to_string(),
            link_selector: "a.programlink".to_string(),
            alternate_link_selectors: vec![
                "a[href*='programhub.aspx']".to_string(),
                ".program-title a".to_string(),
                "h3 a[href]".to_string(),
            ],
            detail_url_template: "https://www.pathwaystoscience.org/programhub.aspx?sid={sid}".to_string(),
            batch_size: 20,
            max_concurrency: 10,
            request_delay_ms: 1_000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathwaysExtractor {
    config: PathwaysConfig,
}

impl PathwaysExtractor {
    pub fn new(config: PathwaysConfig) -> Self {
        Self { config }
    }

    fn request(&self, url: &str) -> FetchRequest {
        FetchRequest::get(url).timeout(Duration::from_secs(self.config.timeout_secs))
    }

    async fn fetch_detail(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<RawProgramRecord, AdapterError> {
        let request = self
            .request(url)
            .polite_delay(Duration::from_millis(self.config.request_delay_ms));
        let page = http.fetch(ctx.run_id, SOURCE_ID, &request, RetryPolicy::Once).await?;
        Ok(parse_program_page(&page.text(), url))
    }
}

#[async_trait]
impl ProgramExtractor for PathwaysExtractor {
    fn source(&self) -> SourceTag {
        SourceTag::PathwaysToScience
    }

    /// Listing failures propagate (429 as `RateLimited`); detail failures are logged and skipped.
    async fn extract(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawProgramRecord>, AdapterError> {
        let listing = http
            .fetch(ctx.run_id, SOURCE_ID, &self.request(&self.config.listing_url), RetryPolicy::Once)
            .await?;
        let links = discover_links(&listing.text(), &listing.final_url, &self.config);
        info!(source = SOURCE_ID, count = links.len(), "discovered program links");

        let mut records = Vec::with_capacity(links.len());
        let batches = fetch_in_batches(
            links,
            self.config.batch_size,
            self.config.max_concurrency,
            |url| async move { self.fetch_detail(http, ctx, &url).await },
        )
        .await;
        let total = batches.len();

        for (idx, results) in batches.into_iter().enumerate() {
            let mut fetched = 0usize;
            for (url, result) in results {
                match result {
                    Ok(record) => {
                        fetched += 1;
                        records.push(record);
                    }
                    Err(err) => warn!(source = SOURCE_ID, %url, error = %err, "skipping program page"),
                }
            }
            info!(source = SOURCE_ID, batch = idx + 1, batches = total, fetched, "processed detail batch");
        }

        Ok(records)
    }
}

/// Runs `fetch` over `links` one batch at a time with at most `max_concurrency` calls in flight.
/// A batch starts only once the previous one has fully settled; results keep link order.
async fn fetch_in_batches<T, F, Fut>(
    links: Vec<String>,
    batch_size: usize,
    max_concurrency: usize,
    fetch: F,
) -> Vec<Vec<(String, T)>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = T>,
{
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(links.len().div_ceil(batch_size));
    for batch in links.chunks(batch_size) {
        let results = stream::iter(batch.iter().cloned())
            .map(|url| {
                let pending = fetch(url.clone());
                async move { (url, pending.await) }
            })
            .buffered(max_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        batches.push(results);
    }
    batches
}

fn parse_selector(raw: &str) -> Option<Selector> {
    match Selector::parse(raw) {
        Ok(selector) => Some(selector),
        Err(err) => {
            warn!(source = SOURCE_ID, selector = raw, error = %err, "ignoring invalid link selector");
            None
        }
    }
}

fn links_for_selector(document: &Html, base: Option<&Url>, selector: &str) -> BTreeSet<String> {
    let Some(selector) = parse_selector(selector) else {
        return BTreeSet::new();
    };
    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| resolve_link(base, href))
        .collect()
}

fn resolve_link(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match base {
        Some(base) => base.join(href).ok().map(String::from),
        None => Url::parse(href).ok().map(String::from),
    }
}

/// Program detail URLs from listing HTML: primary selector, then raw program ids, then alternate selectors.
pub fn discover_links(html: &str, listing_url: &str, config: &PathwaysConfig) -> Vec<String> {
    let document = Html::parse_document(html);
    let base = Url::parse(listing_url).ok();

    let mut links = links_for_selector(&document, base.as_ref(), &config.link_selector);

    if links.is_empty() {
        links = PROGRAM_ID
            .captures_iter(html)
            .map(|caps| config.detail_url_template.replace("{sid}", &caps[1]))
            .collect();
        if !links.is_empty() {
            debug!(source = SOURCE_ID, count = links.len(), "links recovered from program ids");
        }
    }

    if links.is_empty() {
        for selector in &config.alternate_link_selectors {
            links = links_for_selector(&document, base.as_ref(), selector);
            if !links.is_empty() {
                debug!(source = SOURCE_ID, %selector, count = links.len(), "links found with alternate selector");
                break;
            }
        }
    }

    links.into_iter().collect()
}

fn is_label(element: ElementRef<'_>) -> bool {
    LABEL_ANCHORS.matches(&element) && collapse_whitespace(&element_text(element)).ends_with(':')
}

fn same_label(text: &str, label: &str) -> bool {
    let text = collapse_whitespace(text);
    text.eq_ignore_ascii_case(label) || text.eq_ignore_ascii_case(label.trim_end_matches(':'))
}

/// Text following a label element in the DOM; paragraphs are joined by blank lines.
fn labeled_text(document: &Html, label: &str) -> Option<String> {
    for anchor in document.select(&LABEL_ANCHORS) {
        if !same_label(&element_text(anchor), label) {
            continue;
        }

        let mut parts = Vec::new();
        for sibling in anchor.next_siblings() {
            if let Some(element) = ElementRef::wrap(sibling) {
                if is_label(element) {
                    break;
                }
                parts.extend(text_or_none(element_text(element)));
            } else if let Some(text) = sibling.value().as_text() {
                parts.extend(text_or_none(&**text));
            }
        }
        if !parts.is_empty() {
            return Some(parts.join("\n\n"));
        }

        let next_block = anchor
            .parent()
            .and_then(ElementRef::wrap)
            .and_then(|parent| parent.next_siblings().find_map(ElementRef::wrap));
        if let Some(value) = next_block.and_then(|block| text_or_none(element_text(block))) {
            return Some(value);
        }
    }
    None
}

/// Regex pass over raw HTML for a label, stopping at the next label-like tag.
fn regex_labeled_text(html: &str, label: &str) -> Option<String> {
    let raw = LABEL_PATTERNS.get(label)?.captures(html)?.get(1)?.as_str();
    let with_breaks = BLOCK_BREAK.replace_all(raw, "\n\n");
    let stripped = TAG.replace_all(&with_breaks, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&#39;", "'")
        .replace("&quot;", "\"");
    let paragraphs = decoded
        .split("\n\n")
        .filter_map(text_or_none)
        .collect::<Vec<_>>();
    (!paragraphs.is_empty()).then(|| paragraphs.join("\n\n"))
}

fn section(document: &Html, html: &str, label: &str) -> Option<String> {
    labeled_text(document, label).or_else(|| regex_labeled_text(html, label))
}

fn page_title(document: &Html) -> Option<String> {
    select_first_text(document, &TITLE).or_else(|| {
        select_first_text(document, &DOC_TITLE).and_then(|t| {
            let t = t.split(" | ").next().unwrap_or_default();
            text_or_none(t)
        })
    })
}

/// Parse one program page. Pages without a title or institution yield an unusable record.
pub fn parse_program_page(html: &str, url: &str) -> RawProgramRecord {
    let document = Html::parse_document(html);

    let title = page_title(&document);
    let institution = section(&document, html, INSTITUTION_LABEL).map(|s| collapse_whitespace(&s));
    let (Some(title), Some(institution)) = (title, institution) else {
        debug!(source = SOURCE_ID, %url, "program page missing title or institution");
        return RawProgramRecord::unusable(SourceTag::PathwaysToScience, url);
    };

    let description = section(&document, html, DESCRIPTION_LABEL)
        .map(|d| clean_description(&strip_contact_details(&d)))
        .unwrap_or_default();
    let field_text = [KEYWORDS_LABEL, DISCIPLINES_LABEL]
        .iter()
        .filter_map(|label| section(&document, html, label))
        .map(|s| collapse_whitespace(&s))
        .collect::<Vec<_>>()
        .join(", ");

    RawProgramRecord {
        title: Some(title),
        institution: Some(institution),
        location: section(&document, html, LOCATION_LABEL).map(|s| collapse_whitespace(&s)),
        field_text: FieldInput::Text(field_text),
        description,
        deadline_raw: section(&document, html, DEADLINE_LABEL)
            .map(|s| DeadlineRaw::Text(collapse_whitespace(&s))),
        stipend_raw: section(&document, html, STIPEND_LABEL).map(|s| collapse_whitespace(&s)),
        duration_raw: None,
        requirements_raw: None,
        url: Some(url.to_string()),
        source: SourceTag::PathwaysToScience,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use reu_storage::HttpClientConfig;
    use std::path::PathBuf;

    fn fixture(name: &str) -> String {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/pathways")
            .join(name);
        std::fs::read_to_string(path).unwrap()
    }

    fn fast_config(server_url: &str) -> PathwaysConfig {
        PathwaysConfig {
            listing_url: format!("{server_url}/programs.aspx"),
            detail_url_template: format!("{server_url}/programhub.aspx?sid={{sid}}"),
            request_delay_ms: 0,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    #[test]
    fn primary_selector_links_are_resolved_and_deduplicated() {
        let links = discover_links(
            &fixture("listing.html"),
            "https://www.pathwaystoscience.org/programs.aspx",
            &PathwaysConfig::default(),
        );
        assert_eq!(
            links,
            vec![
                "https://www.pathwaystoscience.org/programhub.aspx?sid=1001".to_string(),
                "https://www.pathwaystoscience.org/programhub.aspx?sid=1002".to_string(),
            ]
        );
    }

    #[test]
    fn program_ids_are_recovered_when_selector_misses() {
        let html = r#"<div onclick="go('programhub.aspx?sid=77&amp;u=x')">A</div>
                      <script>var next = "/programhub.aspx?u=y&sid=78";</script>"#;
        let links = discover_links(html, "https://www.pathwaystoscience.org/", &PathwaysConfig::default());
        assert_eq!(
            links,
            vec![
                "https://www.pathwaystoscience.org/programhub.aspx?sid=77".to_string(),
                "https://www.pathwaystoscience.org/programhub.aspx?sid=78".to_string(),
            ]
        );
    }

    #[test]
    fn alternate_selectors_are_the_last_resort() {
        let html = r#"<div class="program-title"><a href="/programs/ocean-reu">Ocean REU</a></div>"#;
        let links = discover_links(html, "https://www.pathwaystoscience.org/list", &PathwaysConfig::default());
        assert_eq!(links, vec!["https://www.pathwaystoscience.org/programs/ocean-reu".to_string()]);
    }

    #[test]
    fn detail_page_sections_are_extracted() {
        let record = parse_program_page(&fixture("detail.html"), "https://example.org/p/1001");
        assert_eq!(record.title.as_deref(), Some("Summer Research in Neuroscience"));
        assert_eq!(record.institution.as_deref(), Some("Brown University"));
        assert_eq!(record.location.as_deref(), Some("Providence, RI"));
        assert_eq!(
            record.deadline_raw,
            Some(DeadlineRaw::Text("February 1, 2026".into()))
        );
        assert!(record.description.starts_with("Students join a lab for ten weeks."));
        assert!(!record.description.contains("@"));
        assert!(!record.description.contains("https://"));
        assert!(!record.description.contains("401"));
        match &record.field_text {
            FieldInput::Text(text) => {
                assert!(text.contains("neuroscience"));
                assert!(text.contains("Biology"));
            }
            other => panic!("unexpected field input {other:?}"),
        }
    }

    #[test]
    fn regex_fallback_reads_unanchored_markup() {
        let html = r#"<html><body><h1>Arctic Field School</h1>
            <p><em>Participating Institution(s):</em> University of Alaska Fairbanks</p>
            <p><em>Description:</em> Glacier monitoring.<br>Email arctic@alaska.edu for details.</p>
            </body></html>"#;
        let record = parse_program_page(html, "https://example.org/p/9");
        assert_eq!(record.institution.as_deref(), Some("University of Alaska Fairbanks"));
        assert!(record.description.starts_with("Glacier monitoring."));
        assert!(!record.description.contains("alaska.edu"));
    }

    #[test]
    fn pages_without_institution_are_kept_as_unusable() {
        let html = "<html><body><h1>Mystery Program</h1><p>No details.</p></body></html>";
        let record = parse_program_page(html, "https://example.org/p/2");
        assert!(!record.is_usable());
        assert_eq!(record.title, None);
        assert_eq!(record.url.as_deref(), Some("https://example.org/p/2"));
        assert!(record.description.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_listing_is_surfaced() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/programs.aspx")
            .with_status(429)
            .with_header("retry-after", "90")
            .create_async()
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let extractor = PathwaysExtractor::new(fast_config(&server.url()));
        let err = extractor.extract(&http, &AdapterContext::new()).await.unwrap_err();

        assert!(matches!(err, AdapterError::RateLimited { .. }));
        assert_eq!(err.retry_after_secs(), Some(90));
    }

    #[tokio::test]
    async fn failed_detail_pages_are_skipped() {
        let mut server = Server::new_async().await;
        let listing = r#"<a class="programlink" href="/programhub.aspx?sid=1">One</a>
                         <a class="programlink" href="/programhub.aspx?sid=2">Two</a>"#;
        server
            .mock("GET", "/programs.aspx")
            .with_status(200)
            .with_body(listing)
            .create_async()
            .await;
        server
            .mock("GET", "/programhub.aspx")
            .match_query(mockito::Matcher::UrlEncoded("sid".into(), "1".into()))
            .with_status(200)
            .with_body(fixture("detail.html"))
            .create_async()
            .await;
        server
            .mock("GET", "/programhub.aspx")
            .match_query(mockito::Matcher::UrlEncoded("sid".into(), "2".into()))
            .with_status(500)
            .create_async()
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let extractor = PathwaysExtractor::new(fast_config(&server.url()));
        let records = extractor.extract(&http, &AdapterContext::new()).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].institution.as_deref(), Some("Brown University"));
    }

    #[tokio::test]
    async fn batches_run_sequentially_with_bounded_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Mutex;

        let links = (0..25)
            .map(|i| format!("https://example.org/p/{i}"))
            .collect::<Vec<_>>();
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let settled = AtomicUsize::new(0);
        // (link index, links settled when it started)
        let starts = Mutex::new(Vec::new());

        let batches = fetch_in_batches(links.clone(), 20, 10, |url| {
            let (in_flight, peak, settled, starts) = (&in_flight, &peak, &settled, &starts);
            async move {
                let idx = url.rsplit('/').next().unwrap().parse::<usize>().unwrap();
                starts.lock().unwrap().push((idx, settled.load(Ordering::SeqCst)));
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                settled.fetch_add(1, Ordering::SeqCst);
                idx
            }
        })
        .await;

        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![20, 5]);
        assert_eq!(peak.load(Ordering::SeqCst), 10);
        for (idx, settled_before) in starts.into_inner().unwrap() {
            if idx >= 20 {
                assert_eq!(settled_before, 20, "link {idx} started before the first batch settled");
            } else {
                assert!(settled_before < 20);
            }
        }
        let flattened = batches.into_iter().flatten().collect::<Vec<_>>();
        assert_eq!(flattened.iter().map(|(url, _)| url.clone()).collect::<Vec<_>>(), links);
        assert!(flattened.iter().enumerate().all(|(i, (_, idx))| i == *idx));
    }

    #[tokio::test]
    async fn every_discovered_link_is_fetched_across_batches() {
        let mut server = Server::new_async().await;
        let listing = (1..=25)
            .map(|i| format!(r#"<a class="programlink" href="/programhub.aspx?sid={i}">P{i}</a>"#))
            .collect::<String>();
        server
            .mock("GET", "/programs.aspx")
            .with_status(200)
            .with_body(listing)
            .create_async()
            .await;
        let details = server
            .mock("GET", "/programhub.aspx")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(fixture("detail.html"))
            .expect(25)
            .create_async()
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let extractor = PathwaysExtractor::new(fast_config(&server.url()));
        let records = extractor.extract(&http, &AdapterContext::new()).await.unwrap();

        assert_eq!(records.len(), 25);
        details.assert_async().await;
    }
}
