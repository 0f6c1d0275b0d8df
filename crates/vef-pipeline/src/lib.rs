//! Stage orchestration: listing ingest → detail enrichment → categorization
//! → reconcile/publish. Stages run sequentially, commit independently, and
//! are each safe to re-run; a restarted process resumes from the enrichment
//! anti-join.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use vef_core::{CanonicalEvent, PipelineStage, RunStat, SourceRecord};
use vef_enrich::{CategorizationEnricher, Categorizer, DetailEnricher, EnrichmentReport};
use vef_fetch::{DetailFetcher, FetcherConfig, HttpFetcher, RequestThrottle};
use vef_match::{CanonicalSelector, MatchConfig, MatchEngine, SourcePrecedence};
use vef_store::EventStore;

pub const CRATE_NAME: &str = "vef-pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Per-run cap on detail fetches per source. Independent from the
    /// throttle interval: the cap bounds volume, the throttle bounds rate.
    pub detail_batch_size: u32,
    pub throttle_secs: u64,
    pub scheduler_enabled: bool,
    pub pipeline_cron: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("VEF_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./events.sqlite")),
            sources_path: std::env::var("VEF_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            user_agent: std::env::var("VEF_USER_AGENT")
                .unwrap_or_else(|_| "vef-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("VEF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            detail_batch_size: std::env::var("VEF_DETAIL_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(25),
            throttle_secs: std::env::var("VEF_THROTTLE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            scheduler_enabled: std::env::var("VEF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            pipeline_cron: std::env::var("VEF_PIPELINE_CRON")
                .unwrap_or_else(|_| "0 10 * * *".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Short stable source code, e.g. `SPR`.
    pub code: String,
    pub display_name: String,
    pub enabled: bool,
    /// Lower wins canonical selection.
    pub precedence: u32,
    /// Hosts whose links on a detail page count as cross-source
    /// registration links.
    #[serde(default)]
    pub link_domains: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub async fn load(path: &PathBuf) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn precedence(&self) -> SourcePrecedence {
        SourcePrecedence::from_ranks(
            self.sources
                .iter()
                .map(|s| (s.code.clone(), s.precedence)),
        )
    }

    /// Union of cross-source link hosts across all sources.
    pub fn link_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for source in &self.sources {
            for domain in &source.link_domains {
                if !domains.contains(domain) {
                    domains.push(domain.clone());
                }
            }
        }
        domains
    }
}

/// External per-source listing fetcher. The scraping itself lives outside
/// this crate; the pipeline only requires the handoff contract.
#[async_trait::async_trait]
pub trait ListingExtractor: Send + Sync {
    fn source(&self) -> &str;
    async fn fetch_listings(&self) -> Result<Vec<SourceRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageReport {
    pub stage: PipelineStage,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl StageReport {
    fn empty(stage: PipelineStage) -> Self {
        Self {
            stage,
            attempted: 0,
            succeeded: 0,
            failed: 0,
        }
    }

    fn absorb(&mut self, report: EnrichmentReport) {
        self.attempted += report.attempted;
        self.succeeded += report.succeeded;
        self.failed += report.failed;
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: SourceRegistry,
    store: EventStore,
    fetcher: Arc<dyn DetailFetcher>,
    throttle: Arc<RequestThrottle>,
    extractors: Vec<Arc<dyn ListingExtractor>>,
    categorizer: Option<Arc<dyn Categorizer>>,
    match_config: MatchConfig,
}

impl Pipeline {
    /// Open the store and wire the real HTTP fetcher from config.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_path).await?;
        let store = EventStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening store {}", config.db_path.display()))?;
        store.init_schema().await.context("initializing schema")?;

        let fetcher = HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let throttle = Arc::new(RequestThrottle::new(Duration::from_secs(
            config.throttle_secs,
        )));

        Ok(Self {
            config,
            registry,
            store,
            fetcher: Arc::new(fetcher),
            throttle,
            extractors: Vec::new(),
            categorizer: None,
            match_config: MatchConfig::default(),
        })
    }

    /// Fully injected constructor; tests wire canned fetchers and an
    /// in-memory store through here.
    pub fn new(
        config: PipelineConfig,
        registry: SourceRegistry,
        store: EventStore,
        fetcher: Arc<dyn DetailFetcher>,
        throttle: Arc<RequestThrottle>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            fetcher,
            throttle,
            extractors: Vec::new(),
            categorizer: None,
            match_config: MatchConfig::default(),
        }
    }

    pub fn with_extractors(mut self, extractors: Vec<Arc<dyn ListingExtractor>>) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn with_categorizer(mut self, categorizer: Arc<dyn Categorizer>) -> Self {
        self.categorizer = Some(categorizer);
        self
    }

    pub fn with_match_config(mut self, match_config: MatchConfig) -> Self {
        self.match_config = match_config;
        self
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_all(&self) -> Result<Vec<StageReport>> {
        let mut reports = Vec::new();
        for stage in PipelineStage::all() {
            reports.push(self.run_stage(stage).await?);
        }
        Ok(reports)
    }

    pub async fn run_stage(&self, stage: PipelineStage) -> Result<StageReport> {
        let result = match stage {
            PipelineStage::Ingest => self.ingest().await,
            PipelineStage::EnrichDetails => self.enrich_details().await,
            PipelineStage::Categorize => self.categorize().await,
            PipelineStage::Reconcile => self.reconcile().await,
        };
        result.with_context(|| format!("stage {} failed", stage.as_str()))
    }

    async fn ingest(&self) -> Result<StageReport> {
        let mut report = StageReport::empty(PipelineStage::Ingest);
        if self.extractors.is_empty() {
            info!("no listing extractors wired; ingest is a no-op");
            return Ok(report);
        }

        for extractor in &self.extractors {
            let source = extractor.source().to_string();
            let (attempted, succeeded, failed) = match extractor.fetch_listings().await {
                Ok(listings) => {
                    let total = listings.len() as u64;
                    let mut valid = Vec::with_capacity(listings.len());
                    let mut dropped = 0u64;
                    for record in listings {
                        match validate_record(&record) {
                            Ok(()) => valid.push(record),
                            Err(reason) => {
                                dropped += 1;
                                warn!(
                                    key = %record.key(),
                                    reason,
                                    "dropping record failing integrity check"
                                );
                            }
                        }
                    }
                    self.store.upsert_source_records(&valid).await?;
                    (total, total - dropped, dropped)
                }
                Err(err) => {
                    warn!(source = %source, error = %err, "listing fetch failed");
                    (1, 0, 1)
                }
            };

            report.attempted += attempted;
            report.succeeded += succeeded;
            report.failed += failed;
            self.record_stat(PipelineStage::Ingest, Some(&source), attempted, succeeded, failed)
                .await?;
        }
        Ok(report)
    }

    async fn enrich_details(&self) -> Result<StageReport> {
        let enricher = DetailEnricher::new(
            self.store.clone(),
            self.fetcher.clone(),
            self.throttle.clone(),
            self.registry.link_domains(),
        );

        let mut report = StageReport::empty(PipelineStage::EnrichDetails);
        for source in self.registry.enabled_sources() {
            let batch = enricher
                .run(&source.code, self.config.detail_batch_size)
                .await?;
            report.absorb(batch);
            self.record_stat(
                PipelineStage::EnrichDetails,
                Some(&source.code),
                batch.attempted,
                batch.succeeded,
                batch.failed,
            )
            .await?;
        }
        Ok(report)
    }

    async fn categorize(&self) -> Result<StageReport> {
        let mut report = StageReport::empty(PipelineStage::Categorize);
        let Some(categorizer) = &self.categorizer else {
            info!("no categorizer wired; categorize is a no-op");
            return Ok(report);
        };

        let enricher = CategorizationEnricher::new(self.store.clone(), categorizer.clone());
        for source in self.registry.enabled_sources() {
            let batch = enricher
                .run(&source.code, self.config.detail_batch_size)
                .await?;
            report.absorb(batch);
            self.record_stat(
                PipelineStage::Categorize,
                Some(&source.code),
                batch.attempted,
                batch.succeeded,
                batch.failed,
            )
            .await?;
        }
        Ok(report)
    }

    /// Match, cluster, select, publish. Clusters are recomputed from
    /// scratch; the canonical tables are replaced in one transaction.
    async fn reconcile(&self) -> Result<StageReport> {
        let records = self.store.source_records().await?;
        let total = records.len() as u64;

        let mut valid = Vec::with_capacity(records.len());
        let mut dropped = 0u64;
        for record in records {
            match validate_record(&record) {
                Ok(()) => valid.push(record),
                Err(reason) => {
                    dropped += 1;
                    warn!(
                        key = %record.key(),
                        reason,
                        "excluding record from matching"
                    );
                }
            }
        }

        let details = self.store.detail_enrichments().await?;
        let categorizations = self.store.categorizations().await?;
        let joined = vef_match::join_enrichment(valid, &details, &categorizations);

        let engine = MatchEngine::new(self.match_config);
        let selector = CanonicalSelector::new(self.registry.precedence());
        let selections = vef_match::reconcile(&joined, &engine, &selector);

        let mut canonical: Vec<CanonicalEvent> = Vec::with_capacity(selections.len());
        let mut subordinates: Vec<SourceRecord> = Vec::new();
        for selection in selections {
            canonical.push(selection.canonical);
            subordinates.extend(selection.subordinates);
        }

        self.store.upsert_source_records(&subordinates).await?;
        self.store.publish_canonical(&canonical).await?;
        info!(
            records = total,
            canonical = canonical.len(),
            merged = subordinates.len(),
            dropped,
            "published canonical event set"
        );

        let report = StageReport {
            stage: PipelineStage::Reconcile,
            attempted: total,
            succeeded: canonical.len() as u64,
            failed: dropped,
        };
        self.record_stat(
            PipelineStage::Reconcile,
            None,
            report.attempted,
            report.succeeded,
            report.failed,
        )
        .await?;
        Ok(report)
    }

    async fn record_stat(
        &self,
        stage: PipelineStage,
        source: Option<&str>,
        attempted: u64,
        succeeded: u64,
        failed: u64,
    ) -> Result<()> {
        self.store
            .record_run(&RunStat {
                id: Uuid::new_v4().to_string(),
                stage,
                source: source.map(str::to_string),
                attempted,
                succeeded,
                failed,
                ran_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

/// Records failing these checks never enter matching: a fabricated default
/// would be worse than a dropped row.
fn validate_record(record: &SourceRecord) -> Result<(), &'static str> {
    if record.title.trim().is_empty() {
        return Err("empty title");
    }
    if record.url.trim().is_empty() {
        return Err("empty url");
    }
    if record.end < record.start {
        return Err("end precedes start");
    }
    Ok(())
}

/// Periodic full runs, enabled by config. The returned scheduler must be
/// started and kept alive by the caller.
pub async fn maybe_build_scheduler(pipeline: Arc<Pipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config.pipeline_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_all().await {
                Ok(reports) => {
                    for report in reports {
                        info!(
                            stage = report.stage.as_str(),
                            attempted = report.attempted,
                            succeeded = report.succeeded,
                            failed = report.failed,
                            "scheduled stage complete"
                        );
                    }
                }
                Err(err) => warn!(error = %err, "scheduled pipeline run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use vef_core::{EnrichmentKind, EventCategory};
    use vef_enrich::CategoryJudgement;
    use vef_fetch::FetchError;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            db_path: PathBuf::from(":memory:"),
            sources_path: PathBuf::from("sources.yaml"),
            user_agent: "vef-test/0".into(),
            http_timeout_secs: 5,
            detail_batch_size: 10,
            throttle_secs: 0,
            scheduler_enabled: false,
            pipeline_cron: "0 10 * * *".into(),
        }
    }

    fn test_registry() -> SourceRegistry {
        SourceRegistry {
            sources: vec![
                SourceConfig {
                    code: "SPR".into(),
                    display_name: "Seattle Parks & Recreation".into(),
                    enabled: true,
                    precedence: 1,
                    link_domains: vec!["gsp.example.org".into()],
                    notes: None,
                },
                SourceConfig {
                    code: "GSP".into(),
                    display_name: "Green Seattle Partnership".into(),
                    enabled: true,
                    precedence: 2,
                    link_domains: vec![],
                    notes: None,
                },
            ],
        }
    }

    fn mk_record(source: &str, source_id: &str, title: &str) -> SourceRecord {
        SourceRecord {
            source: source.to_string(),
            source_id: source_id.to_string(),
            title: title.to_string(),
            start: Utc.with_ymd_and_hms(2024, 6, 15, 17, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 6, 15, 19, 0, 0).unwrap(),
            venue: None,
            address: None,
            url: format!(
                "https://{}.example.org/event/{source_id}",
                source.to_lowercase()
            ),
            cost: None,
            latitude: None,
            longitude: None,
            tags: vec![],
            same_as: None,
            payload: None,
        }
    }

    struct CannedExtractor {
        source: String,
        listings: Result<Vec<SourceRecord>, String>,
    }

    #[async_trait]
    impl ListingExtractor for CannedExtractor {
        fn source(&self) -> &str {
            &self.source
        }

        async fn fetch_listings(&self) -> Result<Vec<SourceRecord>> {
            match &self.listings {
                Ok(listings) => Ok(listings.clone()),
                Err(message) => anyhow::bail!("{message}"),
            }
        }
    }

    struct CannedFetcher {
        pages: HashMap<String, String>,
    }

    #[async_trait]
    impl DetailFetcher for CannedFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            self.pages.get(url).cloned().ok_or(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    struct ParksCategorizer;

    #[async_trait]
    impl Categorizer for ParksCategorizer {
        async fn categorize(&self, _record: &SourceRecord) -> Result<CategoryJudgement> {
            Ok(CategoryJudgement {
                category: EventCategory::VolunteerParks,
                rationale: None,
                confidence: Some(0.9),
            })
        }
    }

    async fn test_pipeline(pages: HashMap<String, String>) -> Pipeline {
        let store = EventStore::open_in_memory().await.expect("open");
        store.init_schema().await.expect("schema");
        Pipeline::new(
            test_config(),
            test_registry(),
            store,
            Arc::new(CannedFetcher { pages }),
            Arc::new(RequestThrottle::new(Duration::ZERO)),
        )
    }

    #[tokio::test]
    async fn ingest_records_per_source_stats_and_survives_a_failing_source() {
        let pipeline = test_pipeline(HashMap::new()).await.with_extractors(vec![
            Arc::new(CannedExtractor {
                source: "SPR".into(),
                listings: Ok(vec![
                    mk_record("SPR", "1", "Alki Beach Cleanup"),
                    mk_record("SPR", "2", "Carkeek Work Party"),
                ]),
            }),
            Arc::new(CannedExtractor {
                source: "GSP".into(),
                listings: Err("calendar endpoint returned 503".into()),
            }),
        ]);

        let report = pipeline.run_stage(PipelineStage::Ingest).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(pipeline.store().source_record_count().await.unwrap(), 2);

        let latest = pipeline
            .store()
            .latest_runs_for_stage(PipelineStage::Ingest)
            .await
            .unwrap();
        assert_eq!(latest.len(), 2);
    }

    #[tokio::test]
    async fn integrity_failures_are_dropped_not_defaulted() {
        let mut inverted = mk_record("SPR", "bad", "Inverted Times");
        std::mem::swap(&mut inverted.start, &mut inverted.end);

        let pipeline = test_pipeline(HashMap::new())
            .await
            .with_extractors(vec![Arc::new(CannedExtractor {
                source: "SPR".into(),
                listings: Ok(vec![mk_record("SPR", "ok", "Valid Event"), inverted]),
            })]);

        let report = pipeline.run_stage(PipelineStage::Ingest).await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(pipeline.store().source_record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn full_run_publishes_canonical_set_and_is_idempotent() {
        // SPR page links to the GSP listing, giving the reconciler
        // shared-URL evidence on top of title/date agreement.
        let spr = mk_record("SPR", "1", "Lincoln Park Work Party");
        let gsp = mk_record("GSP", "7", "Lincoln Park Work Party");
        let mut pages = HashMap::new();
        pages.insert(
            spr.url.clone(),
            format!(r#"<html><body><a href="{}">register</a></body></html>"#, gsp.url),
        );
        pages.insert(
            gsp.url.clone(),
            "<html><body><p>no outside links</p></body></html>".to_string(),
        );

        let pipeline = test_pipeline(pages)
            .await
            .with_extractors(vec![
                Arc::new(CannedExtractor {
                    source: "SPR".into(),
                    listings: Ok(vec![spr.clone()]),
                }),
                Arc::new(CannedExtractor {
                    source: "GSP".into(),
                    listings: Ok(vec![gsp.clone()]),
                }),
            ])
            .with_categorizer(Arc::new(ParksCategorizer));

        let reports = pipeline.run_all().await.unwrap();
        assert_eq!(reports.len(), 4);

        let canonical = pipeline.store().canonical_events().await.unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].source_events.len(), 2);
        assert_eq!(canonical[0].source_events[0], "SPR:1");

        // the merged GSP record now points at the canonical URL
        let records = pipeline.store().source_records().await.unwrap();
        let merged = records.iter().find(|r| r.source == "GSP").unwrap();
        assert_eq!(merged.same_as.as_deref(), Some(canonical[0].url.as_str()));

        // second full run: enrichment has nothing to do, canonical set is stable
        let reports = pipeline.run_all().await.unwrap();
        let enrich = reports
            .iter()
            .find(|r| r.stage == PipelineStage::EnrichDetails)
            .unwrap();
        assert_eq!(enrich.attempted, 0);

        let canonical_again = pipeline.store().canonical_events().await.unwrap();
        assert_eq!(canonical_again.len(), 1);
        assert_eq!(canonical_again[0].canonical_id, canonical[0].canonical_id);

        let progress = pipeline
            .store()
            .enrichment_progress(EnrichmentKind::DetailPage, None)
            .await
            .unwrap();
        assert_eq!((progress.enriched, progress.total), (2, 2));
    }

    #[tokio::test]
    async fn registry_parses_from_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        tokio::fs::write(
            &path,
            r#"
sources:
  - code: SPR
    display_name: Seattle Parks & Recreation
    enabled: true
    precedence: 1
    link_domains:
      - seattle.greencitypartnerships.org
  - code: SPF
    display_name: Seattle Parks Foundation
    enabled: false
    precedence: 3
"#,
        )
        .await
        .unwrap();

        let registry = SourceRegistry::load(&path).await.unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.enabled_sources().count(), 1);
        assert_eq!(registry.precedence().rank("SPR"), 1);
        assert_eq!(registry.precedence().rank("UNKNOWN"), u32::MAX);
        assert_eq!(
            registry.link_domains(),
            vec!["seattle.greencitypartnerships.org".to_string()]
        );
    }

    #[tokio::test]
    async fn stage_failures_name_the_stage() {
        let pipeline = test_pipeline(HashMap::new())
            .await
            .with_extractors(vec![Arc::new(CannedExtractor {
                source: "SPR".into(),
                listings: Ok(vec![mk_record("SPR", "1", "Event")]),
            })]);
        // break the store under the stage
        sqlx_drop_events_table(pipeline.store()).await;

        let err = pipeline.run_stage(PipelineStage::Ingest).await.unwrap_err();
        assert!(format!("{err:#}").contains("stage ingest failed"));
    }

    async fn sqlx_drop_events_table(store: &EventStore) {
        sqlx::query("DROP TABLE events")
            .execute(store.pool())
            .await
            .expect("drop");
    }
}
