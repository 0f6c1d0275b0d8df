//! Incremental enrichment of under-enriched source records.
//!
//! Two independent streams share the same batch shape: pull a backlog via
//! the store's anti-join, process each item behind its politeness limits,
//! persist a success or failure row. A failing item is recorded and skipped;
//! it never aborts the batch and never reappears in the backlog.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{info, warn};

use vef_core::urls::{host_of, normalize_url};
use vef_core::{
    CategorizationEnrichment, DetailPageEnrichment, EnrichmentStatus, EventCategory, SourceRecord,
};
use vef_fetch::{DetailFetcher, FetchError, RequestThrottle};
use vef_store::{EventStore, StoreError};

pub const CRATE_NAME: &str = "vef-enrich";

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse failure: {0}")]
    Parse(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Fields extracted from a detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailExtract {
    pub registration_url: Option<String>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
}

/// Pull auxiliary identity fields out of a fetched detail page.
///
/// The registration link is the first absolute anchor pointing at a host
/// other than the page's own, restricted to `link_domains` when that list
/// is non-empty. An empty body counts as a parse failure; absent fields do
/// not (sparse pages are normal).
pub fn parse_detail_page(
    html: &str,
    page_url: &str,
    link_domains: &[String],
) -> Result<DetailExtract, EnrichError> {
    if html.trim().is_empty() {
        return Err(EnrichError::Parse(format!("empty page body for {page_url}")));
    }

    let document = Html::parse_document(html);
    let own_host = host_of(page_url);

    let anchor_sel = selector("a[href]")?;
    let registration_url = document
        .select(&anchor_sel)
        .filter_map(|node| node.value().attr("href"))
        .filter(|href| !href.starts_with("mailto:"))
        .filter_map(|href| {
            let host = host_of(href)?;
            if Some(&host) == own_host.as_ref() {
                return None;
            }
            if !link_domains.is_empty() && !link_domains.iter().any(|d| d == &host) {
                return None;
            }
            Some(normalize_url(href))
        })
        .next();

    let mailto_sel = selector("a[href^='mailto:']")?;
    let contact_email = document
        .select(&mailto_sel)
        .filter_map(|node| node.value().attr("href"))
        .map(|href| href.trim_start_matches("mailto:").trim().to_string())
        .find(|email| !email.is_empty());

    let contact_sel = selector(".contact, #contact")?;
    let contact_name = document
        .select(&contact_sel)
        .map(|node| node.text().collect::<String>().trim().to_string())
        .find(|text| !text.is_empty());

    Ok(DetailExtract {
        registration_url,
        contact_name,
        contact_email,
    })
}

fn selector(css: &str) -> Result<Selector, EnrichError> {
    Selector::parse(css).map_err(|e| EnrichError::Parse(e.to_string()))
}

/// Works the detail-page backlog for one source. The per-run item cap and
/// the domain throttle are independent knobs: the cap bounds catch-up
/// volume, the throttle bounds burst rate.
pub struct DetailEnricher {
    store: EventStore,
    fetcher: Arc<dyn DetailFetcher>,
    throttle: Arc<RequestThrottle>,
    link_domains: Vec<String>,
}

impl DetailEnricher {
    pub fn new(
        store: EventStore,
        fetcher: Arc<dyn DetailFetcher>,
        throttle: Arc<RequestThrottle>,
        link_domains: Vec<String>,
    ) -> Self {
        Self {
            store,
            fetcher,
            throttle,
            link_domains,
        }
    }

    pub async fn run(&self, source: &str, max_items: u32) -> Result<EnrichmentReport, EnrichError> {
        let backlog = self.store.detail_backlog(source, max_items).await?;
        info!(source, backlog = backlog.len(), "detail enrichment batch");

        let mut report = EnrichmentReport::default();
        for record in backlog {
            report.attempted += 1;
            let enrichment = match self.enrich_one(&record).await {
                Ok(extract) => {
                    report.succeeded += 1;
                    DetailPageEnrichment {
                        source: record.source.clone(),
                        source_id: record.source_id.clone(),
                        detail_url: record.url.clone(),
                        registration_url: extract.registration_url,
                        contact_name: extract.contact_name,
                        contact_email: extract.contact_email,
                        fetched_at: Utc::now(),
                        status: EnrichmentStatus::Success,
                        error: None,
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        source = %record.source,
                        source_id = %record.source_id,
                        error = %err,
                        "detail enrichment item failed"
                    );
                    DetailPageEnrichment {
                        source: record.source.clone(),
                        source_id: record.source_id.clone(),
                        detail_url: record.url.clone(),
                        registration_url: None,
                        contact_name: None,
                        contact_email: None,
                        fetched_at: Utc::now(),
                        status: EnrichmentStatus::Failed,
                        error: Some(err.to_string()),
                    }
                }
            };
            // a store write failure is fatal to the stage, not a per-item miss
            self.store.insert_detail_enrichment(&enrichment).await?;
        }
        Ok(report)
    }

    async fn enrich_one(&self, record: &SourceRecord) -> Result<DetailExtract, EnrichError> {
        self.throttle.wait_if_needed(&record.url).await?;
        let body = self.fetcher.fetch_text(&record.url).await?;
        parse_detail_page(&body, &record.url, &self.link_domains)
    }
}

/// Verdict from the categorization collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryJudgement {
    pub category: EventCategory,
    pub rationale: Option<String>,
    pub confidence: Option<f64>,
}

/// External classifier seam. The production implementation lives outside
/// this crate; tests inject canned judgements.
#[async_trait]
pub trait Categorizer: Send + Sync {
    async fn categorize(&self, record: &SourceRecord) -> anyhow::Result<CategoryJudgement>;
}

/// Works the categorization backlog for one source, mirroring the detail
/// enricher's per-item failure handling.
pub struct CategorizationEnricher {
    store: EventStore,
    categorizer: Arc<dyn Categorizer>,
}

impl CategorizationEnricher {
    pub fn new(store: EventStore, categorizer: Arc<dyn Categorizer>) -> Self {
        Self { store, categorizer }
    }

    pub async fn run(&self, source: &str, max_items: u32) -> Result<EnrichmentReport, EnrichError> {
        let backlog = self.store.categorization_backlog(source, max_items).await?;
        info!(source, backlog = backlog.len(), "categorization batch");

        let mut report = EnrichmentReport::default();
        for record in backlog {
            report.attempted += 1;
            let enrichment = match self.categorizer.categorize(&record).await {
                Ok(judgement) => {
                    report.succeeded += 1;
                    CategorizationEnrichment {
                        source: record.source.clone(),
                        source_id: record.source_id.clone(),
                        category: Some(judgement.category),
                        rationale: judgement.rationale,
                        confidence: judgement.confidence,
                        created_at: Utc::now(),
                        status: EnrichmentStatus::Success,
                        error: None,
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        source = %record.source,
                        source_id = %record.source_id,
                        error = %err,
                        "categorization item failed"
                    );
                    CategorizationEnrichment {
                        source: record.source.clone(),
                        source_id: record.source_id.clone(),
                        category: None,
                        rationale: None,
                        confidence: None,
                        created_at: Utc::now(),
                        status: EnrichmentStatus::Failed,
                        error: Some(err.to_string()),
                    }
                }
            };
            self.store.insert_categorization(&enrichment).await?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::time::Duration;

    fn mk_record(source: &str, source_id: &str, url: &str) -> SourceRecord {
        SourceRecord {
            source: source.to_string(),
            source_id: source_id.to_string(),
            title: format!("Event {source_id}"),
            start: Utc.with_ymd_and_hms(2024, 6, 15, 17, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 6, 15, 19, 0, 0).unwrap(),
            venue: None,
            address: None,
            url: url.to_string(),
            cost: None,
            latitude: None,
            longitude: None,
            tags: vec![],
            same_as: None,
            payload: None,
        }
    }

    struct CannedFetcher {
        pages: HashMap<String, Result<String, u16>>,
    }

    #[async_trait]
    impl DetailFetcher for CannedFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            match self.pages.get(url) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(status)) => Err(FetchError::HttpStatus {
                    status: *status,
                    url: url.to_string(),
                }),
                None => Err(FetchError::InvalidUrl(url.to_string())),
            }
        }
    }

    async fn fresh_store(records: &[SourceRecord]) -> EventStore {
        let store = EventStore::open_in_memory().await.expect("open");
        store.init_schema().await.expect("schema");
        store.upsert_source_records(records).await.expect("seed");
        store
    }

    const DETAIL_PAGE: &str = r#"
        <html><body>
          <h2>Lizard Haven Weeding</h2>
          <p><a href="/event/42030/register">Register here</a></p>
          <p><a href="https://seattle.greencitypartnerships.org/event/42030/">Hosted by GSP</a></p>
          <p class="contact">Rob Stevens</p>
          <p><a href="mailto:rob@example.org">Email the steward</a></p>
        </body></html>
    "#;

    #[test]
    fn parses_cross_source_link_and_contacts() {
        let extract = parse_detail_page(
            DETAIL_PAGE,
            "https://anc.apm.activecommunities.com/seattle/activity/1",
            &["seattle.greencitypartnerships.org".to_string()],
        )
        .unwrap();
        assert_eq!(
            extract.registration_url.as_deref(),
            Some("https://seattle.greencitypartnerships.org/event/42030")
        );
        assert_eq!(extract.contact_name.as_deref(), Some("Rob Stevens"));
        assert_eq!(extract.contact_email.as_deref(), Some("rob@example.org"));
    }

    #[test]
    fn own_host_links_are_not_registration_links() {
        let html = r#"<html><body><a href="https://example.org/event/2">next event</a></body></html>"#;
        let extract = parse_detail_page(html, "https://example.org/event/1", &[]).unwrap();
        assert_eq!(extract.registration_url, None);
    }

    #[test]
    fn empty_body_is_a_parse_failure() {
        let err = parse_detail_page("   ", "https://example.org/event/1", &[]).unwrap_err();
        assert!(matches!(err, EnrichError::Parse(_)));
    }

    #[tokio::test]
    async fn failing_item_is_recorded_and_batch_continues() {
        let records = [
            mk_record("SPR", "x", "https://spr.example.org/event/x"),
            mk_record("SPR", "y", "https://spr.example.org/event/y"),
            mk_record("SPR", "z", "https://spr.example.org/event/z"),
        ];
        let store = fresh_store(&records).await;

        let mut pages = HashMap::new();
        // x times out at the gateway; y and z respond
        pages.insert("https://spr.example.org/event/x".to_string(), Err(504));
        pages.insert(
            "https://spr.example.org/event/y".to_string(),
            Ok(DETAIL_PAGE.to_string()),
        );
        pages.insert(
            "https://spr.example.org/event/z".to_string(),
            Ok("<html><body><p>nothing linked</p></body></html>".to_string()),
        );

        let enricher = DetailEnricher::new(
            store.clone(),
            Arc::new(CannedFetcher { pages }),
            Arc::new(RequestThrottle::new(Duration::ZERO)),
            vec![],
        );

        let report = enricher.run("SPR", 10).await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);

        let rows = store.detail_enrichments().await.unwrap();
        assert_eq!(rows.len(), 3);
        let failed = rows.iter().find(|r| r.source_id == "x").unwrap();
        assert_eq!(failed.status, EnrichmentStatus::Failed);
        assert!(failed.error.as_deref().unwrap_or_default().contains("504"));

        // backlog is empty regardless of per-item outcome
        assert!(store.detail_backlog("SPR", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn processed_items_are_never_refetched() {
        let records = [mk_record("SPR", "x", "https://spr.example.org/event/x")];
        let store = fresh_store(&records).await;
        let mut pages = HashMap::new();
        pages.insert("https://spr.example.org/event/x".to_string(), Err(500));

        let enricher = DetailEnricher::new(
            store.clone(),
            Arc::new(CannedFetcher { pages }),
            Arc::new(RequestThrottle::new(Duration::ZERO)),
            vec![],
        );

        let first = enricher.run("SPR", 10).await.unwrap();
        assert_eq!(first.failed, 1);

        // the failure is terminal; a second run finds nothing to do
        let second = enricher.run("SPR", 10).await.unwrap();
        assert_eq!(second, EnrichmentReport::default());
    }

    #[tokio::test]
    async fn item_cap_bounds_a_single_run() {
        let records: Vec<SourceRecord> = (0..4)
            .map(|i| {
                mk_record(
                    "SPR",
                    &format!("r{i}"),
                    &format!("https://spr.example.org/event/r{i}"),
                )
            })
            .collect();
        let store = fresh_store(&records).await;

        let pages = records
            .iter()
            .map(|r| (r.url.clone(), Ok("<html><body>ok</body></html>".to_string())))
            .collect();
        let enricher = DetailEnricher::new(
            store.clone(),
            Arc::new(CannedFetcher { pages }),
            Arc::new(RequestThrottle::new(Duration::ZERO)),
            vec![],
        );

        let report = enricher.run("SPR", 3).await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(store.detail_backlog("SPR", 10).await.unwrap().len(), 1);
    }

    struct CannedCategorizer;

    #[async_trait]
    impl Categorizer for CannedCategorizer {
        async fn categorize(&self, record: &SourceRecord) -> anyhow::Result<CategoryJudgement> {
            if record.source_id == "bad" {
                anyhow::bail!("model returned malformed JSON");
            }
            Ok(CategoryJudgement {
                category: EventCategory::VolunteerParks,
                rationale: Some("restoration work party".into()),
                confidence: Some(0.93),
            })
        }
    }

    #[tokio::test]
    async fn categorization_batch_mirrors_detail_semantics() {
        let records = [
            mk_record("GSP", "ok", "https://gsp.example.org/event/ok"),
            mk_record("GSP", "bad", "https://gsp.example.org/event/bad"),
        ];
        let store = fresh_store(&records).await;

        let enricher = CategorizationEnricher::new(store.clone(), Arc::new(CannedCategorizer));
        let report = enricher.run("GSP", 10).await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        let rows = store.categorizations().await.unwrap();
        let ok = rows.iter().find(|r| r.source_id == "ok").unwrap();
        assert_eq!(ok.category, Some(EventCategory::VolunteerParks));
        let bad = rows.iter().find(|r| r.source_id == "bad").unwrap();
        assert_eq!(bad.status, EnrichmentStatus::Failed);
        assert_eq!(bad.category, None);

        assert!(store.categorization_backlog("GSP", 10).await.unwrap().is_empty());
        // the detail backlog is independent and untouched
        assert_eq!(store.detail_backlog("GSP", 10).await.unwrap().len(), 2);
    }
}
