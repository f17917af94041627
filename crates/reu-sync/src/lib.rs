//! Scrape orchestration: extract every source concurrently, then normalize and upsert per source.

pub mod normalize;
pub mod upsert;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use reu_adapters::{extractor_for_source, AdapterContext, AdapterError, ExtractorSettings, ProgramExtractor};
use reu_core::{FallbackCategory, FieldTaxonomy, RawProgramRecord, SourceTag};
use reu_storage::{
    HttpClientConfig, HttpFetcher, InMemoryProgramStore, PgProgramStore, ProgramStore, BROWSER_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub use normalize::{NormalizeReport, NormalizeSettings, Normalizer, ValidationError};
pub use upsert::{dedupe_last_wins, ReconcilingUpsert, UpsertOutcome, UpsertSettings};

pub const CRATE_NAME: &str = "reu-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub sources_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub nsf_api_token: Option<String>,
    pub nsf_user_id: Option<String>,
    pub google_credentials: Option<PathBuf>,
    pub spreadsheet_id: Option<String>,
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: non_empty_env("DATABASE_URL"),
            sources_file: std::env::var("REU_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            scheduler_enabled: std::env::var("REU_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("REU_SYNC_CRON").unwrap_or_else(|_| "0 6 * * *".to_string()),
            user_agent: std::env::var("REU_USER_AGENT").unwrap_or_else(|_| BROWSER_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("REU_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            nsf_api_token: non_empty_env("NSF_API_TOKEN"),
            nsf_user_id: non_empty_env("NSF_USER_ID"),
            google_credentials: non_empty_env("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from),
            spreadsheet_id: non_empty_env("REU_SPREADSHEET_ID"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSettings {
    pub fallback: FallbackCategory,
    pub taxonomy_file: Option<PathBuf>,
}

/// Contents of `sources.yaml`. Secrets come from the environment only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    #[serde(flatten)]
    pub extractors: ExtractorSettings,
    pub fields: FieldSettings,
    pub normalize: NormalizeSettings,
    pub upsert: UpsertSettings,
}

impl SourceSettings {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing sources settings")
    }

    /// Load the registry file; relative paths inside it resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut settings: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        settings.resolve_paths(base);
        Ok(settings)
    }

    /// Like [`SourceSettings::load`], falling back to built-in settings when the file is unusable.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => settings,
            Err(err) => {
                info!(error = %err, "using built-in source settings");
                Self::default()
            }
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        let manual = &mut self.extractors.manual.path;
        if manual.is_relative() {
            *manual = base.join(&*manual);
        }
        if let Some(taxonomy) = self.fields.taxonomy_file.as_mut() {
            if taxonomy.is_relative() {
                *taxonomy = base.join(&*taxonomy);
            }
        }
    }

    pub fn apply_secrets(&mut self, config: &SyncConfig) {
        self.extractors.nsf.api_token = config.nsf_api_token.clone();
        self.extractors.nsf.user_id = config.nsf_user_id.clone();
        self.extractors.spreadsheet.spreadsheet_id = config.spreadsheet_id.clone();
        self.extractors.spreadsheet.credentials_path = config.google_credentials.clone();
    }

    pub fn taxonomy(&self) -> Result<FieldTaxonomy> {
        let Some(path) = &self.fields.taxonomy_file else {
            return Ok(FieldTaxonomy::builtin());
        };
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        FieldTaxonomy::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Fulfilled,
    Rejected,
}

/// Outcome of one source within a run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceResult {
    pub source: SourceTag,
    pub status: SourceStatus,
    /// Raw records the extractor produced.
    pub count: Option<usize>,
    pub inserted: usize,
    pub updated: usize,
    pub rejected: usize,
    pub failed: usize,
    /// Records dropped because a later record in the run targeted the same program.
    pub superseded: usize,
    pub error: Option<String>,
    pub retry_after_secs: Option<u64>,
}

impl SourceResult {
    fn rejected(source: SourceTag, error: String) -> Self {
        Self {
            source,
            status: SourceStatus::Rejected,
            count: None,
            inserted: 0,
            updated: 0,
            rejected: 0,
            failed: 0,
            superseded: 0,
            error: Some(error),
            retry_after_secs: None,
        }
    }

    fn from_adapter_error(source: SourceTag, err: &AdapterError) -> Self {
        Self {
            retry_after_secs: err.retry_after_secs(),
            ..Self::rejected(source, err.to_string())
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.status == SourceStatus::Fulfilled
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub results: Vec<SourceResult>,
}

impl RunSummary {
    pub fn fulfilled(&self) -> usize {
        self.results.iter().filter(|r| r.is_fulfilled()).count()
    }

    pub fn total_written(&self) -> usize {
        self.results.iter().map(|r| r.inserted + r.updated).sum()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    settings: SourceSettings,
    http: HttpFetcher,
    store: Arc<dyn ProgramStore>,
    normalizer: Normalizer,
    upsert: ReconcilingUpsert,
    extractors: BTreeMap<SourceTag, Box<dyn ProgramExtractor>>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, settings: SourceSettings, store: Arc<dyn ProgramStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            per_source_concurrency: settings.extractors.pathways.max_concurrency.max(1),
            ..HttpClientConfig::default()
        })?;
        let normalizer = Normalizer::new(
            settings.taxonomy()?,
            settings.fields.fallback,
            settings.normalize.clone(),
        );
        let upsert = ReconcilingUpsert::new(store.clone(), &settings.upsert);
        let extractors = SourceTag::ALL
            .into_iter()
            .filter_map(|tag| extractor_for_source(tag, &settings.extractors).map(|ex| (tag, ex)))
            .collect();

        Ok(Self {
            config,
            settings,
            http,
            store,
            normalizer,
            upsert,
            extractors,
        })
    }

    /// Replace (or add) the extractor registered for its source tag.
    pub fn with_extractor(mut self, extractor: Box<dyn ProgramExtractor>) -> Self {
        self.extractors.insert(extractor.source(), extractor);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ProgramStore> {
        &self.store
    }

    /// Enabled sources with a registered extractor, in declaration order.
    pub fn default_sources(&self) -> Vec<SourceTag> {
        SourceTag::ALL
            .into_iter()
            .filter(|tag| self.settings.extractors.is_enabled(*tag) && self.extractors.contains_key(tag))
            .collect()
    }

    /// Run the requested sources (all enabled ones when `None`). One result per source, in
    /// request order; a failing source never affects the others.
    pub async fn run_all(&self, sources: Option<&[SourceTag]>) -> RunSummary {
        let requested = match sources {
            Some(list) => {
                let mut unique = Vec::with_capacity(list.len());
                for tag in list {
                    if !unique.contains(tag) {
                        unique.push(*tag);
                    }
                }
                unique
            }
            None => self.default_sources(),
        };

        let ctx = AdapterContext::new();
        info!(run_id = %ctx.run_id, sources = ?requested, "scrape run started");

        let extractions = join_all(requested.iter().map(|tag| {
            let ctx = &ctx;
            async move {
                let extracted = match self.extractors.get(tag) {
                    Some(extractor) => extractor.extract(&self.http, ctx).await,
                    None => Err(AdapterError::Message(format!("no extractor registered for {tag}"))),
                };
                (*tag, extracted)
            }
        }))
        .await;

        let today = Utc::now().date_naive();
        let mut results = Vec::with_capacity(extractions.len());
        for (source, extracted) in extractions {
            let result = match extracted {
                Ok(raws) => self.persist(source, raws, today).await,
                Err(err) => {
                    warn!(%source, error = %err, "extraction failed");
                    SourceResult::from_adapter_error(source, &err)
                }
            };
            info!(
                %source,
                status = ?result.status,
                count = result.count.unwrap_or(0),
                inserted = result.inserted,
                updated = result.updated,
                rejected = result.rejected,
                failed = result.failed,
                superseded = result.superseded,
                "source finished"
            );
            results.push(result);
        }

        let summary = RunSummary {
            run_id: ctx.run_id,
            results,
        };
        info!(
            run_id = %summary.run_id,
            sources = summary.results.len(),
            fulfilled = summary.fulfilled(),
            written = summary.total_written(),
            "scrape run complete"
        );
        summary
    }

    async fn persist(&self, source: SourceTag, raws: Vec<RawProgramRecord>, today: NaiveDate) -> SourceResult {
        let count = raws.len();
        let report = self.normalizer.normalize_batch(&raws, today);
        if !report.rejected.is_empty() {
            warn!(%source, rejected = report.rejected.len(), "records failed validation");
        }
        let rejected = report.rejected.len();

        match self.upsert.upsert(report.programs, source).await {
            Ok(outcome) => SourceResult {
                source,
                status: SourceStatus::Fulfilled,
                count: Some(count),
                inserted: outcome.inserted,
                updated: outcome.updated,
                rejected,
                failed: outcome.failed,
                superseded: outcome.superseded,
                error: None,
                retry_after_secs: None,
            },
            Err(err) => {
                warn!(%source, error = %err, "upsert failed");
                SourceResult {
                    count: Some(count),
                    rejected,
                    ..SourceResult::rejected(source, err.to_string())
                }
            }
        }
    }

    /// Cron job running every enabled source, or `None` when the scheduler is disabled.
    pub async fn maybe_build_scheduler(pipeline: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !pipeline.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = pipeline.config.sync_cron.clone();
        let pipeline = Arc::clone(pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                info!("scheduled scrape triggered");
                let summary = pipeline.run_all(None).await;
                info!(run_id = %summary.run_id, written = summary.total_written(), "scheduled scrape finished");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Postgres when `DATABASE_URL` is set, otherwise an in-memory store (dry run).
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn ProgramStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgProgramStore::connect(url).await.context("connecting to DATABASE_URL")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; writing to an in-memory store (dry run)");
            Ok(Arc::new(InMemoryProgramStore::new()))
        }
    }
}

pub async fn build_pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    let mut settings = SourceSettings::load(&config.sources_file)?;
    settings.apply_secrets(&config);
    let store = connect_store(&config).await?;
    SyncPipeline::new(config, settings, store)
}

pub async fn run_all_from_env(sources: Option<&[SourceTag]>) -> Result<RunSummary> {
    let pipeline = build_pipeline_from_env().await?;
    Ok(pipeline.run_all(sources).await)
}
