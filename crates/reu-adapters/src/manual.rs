use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use reu_core::{RawProgramRecord, SourceTag};
use reu_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{AdapterContext, AdapterError, ProgramExtractor};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for ManualConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("manual/programs.yaml"),
        }
    }
}

/// Administrator-curated programs from a YAML or JSON list.
#[derive(Debug, Clone)]
pub struct ManualExtractor {
    config: ManualConfig,
}

impl ManualExtractor {
    pub fn new(config: ManualConfig) -> Self {
        Self { config }
    }
}

pub fn parse_manual_records(path: &Path, raw: &str) -> anyhow::Result<Vec<RawProgramRecord>> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let mut records: Vec<RawProgramRecord> = if is_json {
        serde_json::from_str(raw).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_yaml::from_str(raw).with_context(|| format!("parsing {}", path.display()))?
    };
    for record in &mut records {
        record.source = SourceTag::Manual;
    }
    Ok(records)
}

#[async_trait]
impl ProgramExtractor for ManualExtractor {
    fn source(&self) -> SourceTag {
        SourceTag::Manual
    }

    async fn extract(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawProgramRecord>, AdapterError> {
        let path = &self.config.path;
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let records = parse_manual_records(path, &raw)?;
        info!(source = "Manual", path = %path.display(), count = records.len(), "manual programs loaded");
        Ok(records)
    }
}
