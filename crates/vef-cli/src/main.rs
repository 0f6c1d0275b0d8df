use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vef_core::{EnrichmentKind, PipelineStage};
use vef_enrich::DetailEnricher;
use vef_fetch::{FetcherConfig, HttpFetcher, RequestThrottle};
use vef_pipeline::{maybe_build_scheduler, Pipeline, PipelineConfig, SourceRegistry, StageReport};
use vef_store::EventStore;

#[derive(Debug, Parser)]
#[command(name = "vef-cli")]
#[command(about = "Volunteer Event Finder pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the database schema (optionally clearing existing data).
    InitDb {
        #[arg(long)]
        reset: bool,
    },
    /// Run every pipeline stage, or a single one.
    Run {
        /// ingest | enrich-details | categorize | reconcile
        #[arg(long)]
        stage: Option<String>,
    },
    /// Work the detail-page backlog for one source.
    Enrich {
        #[arg(long)]
        source: String,
        #[arg(long, default_value_t = 25)]
        max_items: u32,
    },
    /// Match, cluster, select, and publish canonical events.
    Reconcile {
        /// Print examples of merged clusters.
        #[arg(long)]
        show_examples: bool,
    },
    /// List published canonical events.
    List {
        /// Include events that already ended.
        #[arg(long)]
        all: bool,
    },
    /// Per-stage freshness and enrichment progress.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::InitDb { reset } => {
            let store = open_store(&config).await?;
            if reset {
                store.reset().await?;
            }
            println!("database initialized at {}", config.db_path.display());
        }
        Commands::Run { stage } => {
            let pipeline = Pipeline::from_config(config.clone()).await?;
            let reports = match stage.as_deref() {
                Some(name) => {
                    let stage = PipelineStage::parse(name)
                        .with_context(|| format!("unknown stage: {name}"))?;
                    vec![pipeline.run_stage(stage).await?]
                }
                None => pipeline.run_all().await?,
            };
            for report in &reports {
                print_report(report);
            }

            if config.scheduler_enabled {
                let pipeline = Arc::new(pipeline);
                if let Some(sched) = maybe_build_scheduler(pipeline).await? {
                    let mut sched = sched;
                    sched.start().await.context("starting scheduler")?;
                    println!("scheduler running (cron: {}); ctrl-c to stop", config.pipeline_cron);
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                }
            }
        }
        Commands::Enrich { source, max_items } => {
            let store = open_store(&config).await?;
            let registry = SourceRegistry::load(&config.sources_path).await?;
            let fetcher = HttpFetcher::new(FetcherConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })?;
            let enricher = DetailEnricher::new(
                store,
                Arc::new(fetcher),
                Arc::new(RequestThrottle::new(Duration::from_secs(config.throttle_secs))),
                registry.link_domains(),
            );
            let report = enricher.run(&source, max_items).await?;
            println!(
                "enrich {source}: attempted={} succeeded={} failed={}",
                report.attempted, report.succeeded, report.failed
            );
        }
        Commands::Reconcile { show_examples } => {
            let pipeline = Pipeline::from_config(config).await?;
            let report = pipeline.run_stage(PipelineStage::Reconcile).await?;
            print_report(&report);

            if show_examples {
                let canonical = pipeline.store().canonical_events().await?;
                let mut shown = 0;
                for event in canonical.iter().filter(|e| e.source_events.len() > 1) {
                    if shown >= 5 {
                        break;
                    }
                    println!("\n{}", event.title);
                    println!("  {}", format_when(event.start, event.end));
                    println!("  sources: {}", event.source_events.join(", "));
                    println!("  {}", event.url);
                    shown += 1;
                }
                if shown == 0 {
                    println!("no multi-source clusters to show");
                }
            }
        }
        Commands::List { all } => {
            let store = open_store(&config).await?;
            let events = if all {
                store.canonical_events().await?
            } else {
                store.future_canonical_events(Utc::now()).await?
            };
            println!("{} events\n", events.len());
            for event in &events {
                println!("• {}", event.title);
                println!("  {}", format_when(event.start, event.end));
                if let Some(venue) = &event.venue {
                    println!("  {venue}");
                }
                println!("  sources: {}", event.source_events.join(", "));
                println!("  {}\n", event.url);
            }
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            println!("latest ingest runs:");
            for stat in store.latest_runs_for_stage(PipelineStage::Ingest).await? {
                println!(
                    "  {}: {} at {} (attempted={} succeeded={} failed={})",
                    stat.source.as_deref().unwrap_or("-"),
                    if stat.failed == 0 { "ok" } else { "degraded" },
                    stat.ran_at.format("%Y-%m-%d %H:%M UTC"),
                    stat.attempted,
                    stat.succeeded,
                    stat.failed
                );
            }
            for kind in [EnrichmentKind::DetailPage, EnrichmentKind::Categorization] {
                let progress = store.enrichment_progress(kind, None).await?;
                println!(
                    "{} enrichment: {}/{}",
                    kind.as_str(),
                    progress.enriched,
                    progress.total
                );
            }
        }
    }

    Ok(())
}

async fn open_store(config: &PipelineConfig) -> Result<EventStore> {
    let store = EventStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening store {}", config.db_path.display()))?;
    store.init_schema().await.context("initializing schema")?;
    Ok(store)
}

fn print_report(report: &StageReport) {
    println!(
        "stage {}: attempted={} succeeded={} failed={}",
        report.stage.as_str(),
        report.attempted,
        report.succeeded,
        report.failed
    );
}

fn format_when(start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>) -> String {
    if start == end {
        format!("{} (date only)", start.format("%a %Y-%m-%d"))
    } else {
        format!(
            "{} to {}",
            start.format("%a %Y-%m-%d %H:%M"),
            end.format("%H:%M UTC")
        )
    }
}
