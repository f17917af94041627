use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reu_core::{DeadlineRaw, FieldInput, SourceTag};
use reu_storage::PgProgramStore;
use reu_sync::{build_pipeline_from_env, RunSummary, SourceSettings, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "reu-cli")]
#[command(about = "REU program directory scraper")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape sources and upsert the results (all enabled sources by default).
    Scrape {
        #[arg(long = "source", value_name = "TAG")]
        sources: Vec<SourceTag>,
        /// Print the per-source results as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Run scrapes on REU_SYNC_CRON until interrupted.
    Schedule,
    /// Classify free-text research fields.
    Standardize {
        text: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        title: Option<String>,
    },
    /// Normalize a deadline string as a given source would.
    ParseDeadline {
        text: String,
        #[arg(long, default_value = "manual")]
        source: SourceTag,
    },
}

fn print_summary(summary: &RunSummary) {
    println!("scrape complete: run_id={}", summary.run_id);
    for result in &summary.results {
        match &result.error {
            None => println!(
                "  {:<18} fulfilled count={} inserted={} updated={} rejected={} failed={} superseded={}",
                result.source.as_str(),
                result.count.unwrap_or(0),
                result.inserted,
                result.updated,
                result.rejected,
                result.failed,
                result.superseded
            ),
            Some(error) => println!("  {:<18} rejected: {error}", result.source.as_str()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish()
        .try_init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scrape {
        sources: Vec::new(),
        json: false,
    }) {
        Commands::Scrape { sources, json } => {
            let pipeline = build_pipeline_from_env().await?;
            let requested = (!sources.is_empty()).then_some(sources.as_slice());
            let summary = pipeline.run_all(requested).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let Some(url) = config.database_url else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgProgramStore::connect(&url).await.context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(build_pipeline_from_env().await?);
            let Some(mut sched) = SyncPipeline::maybe_build_scheduler(&pipeline).await? else {
                bail!("scheduler disabled; set REU_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Standardize {
            text,
            description,
            title,
        } => {
            let settings = SourceSettings::load_or_default(&SyncConfig::from_env().sources_file);
            let fields = settings.taxonomy()?.standardize(
                &FieldInput::Text(text),
                description.as_deref(),
                title.as_deref(),
                settings.fields.fallback,
            );
            println!("{}", fields.join(", "));
        }
        Commands::ParseDeadline { text, source } => {
            let settings = SourceSettings::load_or_default(&SyncConfig::from_env().sources_file);
            println!(
                "{}",
                settings.normalize.parse_deadline(Some(&DeadlineRaw::Text(text)), source)
            );
        }
    }

    Ok(())
}
