//! SQLite persistence for VEF: raw source records, the two enrichment
//! streams, published canonical events, and pipeline run stats.
//!
//! Row lifetimes are deliberately decoupled: upserting a source record never
//! touches its enrichment rows, and the canonical tables are replaced
//! wholesale inside one transaction at publish time. The store assumes a
//! single writer (the pipeline process); external readers consume the
//! canonical tables only.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

use vef_core::{
    CanonicalEvent, CategorizationEnrichment, DetailPageEnrichment, EnrichmentKind,
    EnrichmentStatus, EventCategory, PipelineStage, RunStat, SourceRecord,
};

pub const CRATE_NAME: &str = "vef-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("invalid stored row: {0}")]
    Corrupt(String),
}

/// Counts for one enrichment kind, used by operational reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentProgress {
    /// Records with an enrichment row of this kind, any status; failures
    /// are terminal and no longer in the backlog.
    pub enriched: u64,
    pub total: u64,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        source TEXT NOT NULL,
        source_id TEXT NOT NULL,
        title TEXT NOT NULL,
        start_utc TEXT NOT NULL,
        end_utc TEXT NOT NULL,
        venue TEXT,
        address TEXT,
        url TEXT NOT NULL,
        cost TEXT,
        latitude REAL,
        longitude REAL,
        tags TEXT NOT NULL DEFAULT '',
        same_as TEXT,
        payload TEXT,
        PRIMARY KEY (source, source_id)
    )",
    "CREATE TABLE IF NOT EXISTS detail_page_enrichments (
        source TEXT NOT NULL,
        source_id TEXT NOT NULL,
        detail_url TEXT NOT NULL,
        registration_url TEXT,
        contact_name TEXT,
        contact_email TEXT,
        fetched_at TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        PRIMARY KEY (source, source_id)
    )",
    "CREATE TABLE IF NOT EXISTS categorization_enrichments (
        source TEXT NOT NULL,
        source_id TEXT NOT NULL,
        category TEXT,
        rationale TEXT,
        confidence REAL,
        created_at TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        PRIMARY KEY (source, source_id)
    )",
    "CREATE TABLE IF NOT EXISTS canonical_events (
        canonical_id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        start_utc TEXT NOT NULL,
        end_utc TEXT NOT NULL,
        venue TEXT,
        address TEXT,
        url TEXT NOT NULL,
        cost TEXT,
        latitude REAL,
        longitude REAL,
        tags TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS event_group_memberships (
        canonical_id TEXT NOT NULL,
        source TEXT NOT NULL,
        source_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        PRIMARY KEY (canonical_id, source, source_id)
    )",
    "CREATE TABLE IF NOT EXISTS pipeline_runs (
        id TEXT PRIMARY KEY,
        stage TEXT NOT NULL,
        source TEXT,
        attempted INTEGER NOT NULL,
        succeeded INTEGER NOT NULL,
        failed INTEGER NOT NULL,
        ran_at TEXT NOT NULL
    )",
];

#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Open (creating if missing) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. A single pooled connection keeps the
    /// database alive for the pool's lifetime.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Clear every table. Used by `init-db --reset` only.
    pub async fn reset(&self) -> Result<(), StoreError> {
        for table in [
            "events",
            "detail_page_enrichments",
            "categorization_enrichments",
            "canonical_events",
            "event_group_memberships",
            "pipeline_runs",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // --- source records ---------------------------------------------------

    /// Idempotent upsert keyed by `(source, source_id)`. Enrichment rows for
    /// the same key are untouched by design.
    pub async fn upsert_source_records(&self, records: &[SourceRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let payload = match &record.payload {
                Some(value) => Some(value.to_string()),
                None => None,
            };
            sqlx::query(
                "INSERT INTO events (source, source_id, title, start_utc, end_utc, venue,
                     address, url, cost, latitude, longitude, tags, same_as, payload)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (source, source_id) DO UPDATE SET
                     title = excluded.title,
                     start_utc = excluded.start_utc,
                     end_utc = excluded.end_utc,
                     venue = excluded.venue,
                     address = excluded.address,
                     url = excluded.url,
                     cost = excluded.cost,
                     latitude = excluded.latitude,
                     longitude = excluded.longitude,
                     tags = excluded.tags,
                     same_as = excluded.same_as,
                     payload = excluded.payload",
            )
            .bind(&record.source)
            .bind(&record.source_id)
            .bind(&record.title)
            .bind(record.start)
            .bind(record.end)
            .bind(&record.venue)
            .bind(&record.address)
            .bind(&record.url)
            .bind(&record.cost)
            .bind(record.latitude)
            .bind(record.longitude)
            .bind(join_tags(&record.tags))
            .bind(&record.same_as)
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = records.len(), "upserted source records");
        Ok(())
    }

    pub async fn source_records(&self) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_RECORD_COLUMNS} FROM events ORDER BY start_utc, source, source_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_record_from_row).collect()
    }

    pub async fn source_record_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    pub async fn future_source_records(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_RECORD_COLUMNS} FROM events
             WHERE start_utc >= ? ORDER BY start_utc, source, source_id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_record_from_row).collect()
    }

    /// Source records belonging to one published canonical event.
    pub async fn records_for_canonical(
        &self,
        canonical_id: &str,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_RECORD_COLUMNS_E} FROM events e
             JOIN event_group_memberships m
               ON m.source = e.source AND m.source_id = e.source_id
             WHERE m.canonical_id = ?
             ORDER BY m.position"
        ))
        .bind(canonical_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_record_from_row).collect()
    }

    // --- enrichment backlogs ----------------------------------------------

    /// Records of `source` with zero detail-page enrichment rows, oldest
    /// start first. Anti-join so the backlog shrinks on success *and*
    /// failure.
    pub async fn detail_backlog(
        &self,
        source: &str,
        limit: u32,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        self.backlog_for_table("detail_page_enrichments", source, limit)
            .await
    }

    /// Records of `source` with zero categorization rows.
    pub async fn categorization_backlog(
        &self,
        source: &str,
        limit: u32,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        self.backlog_for_table("categorization_enrichments", source, limit)
            .await
    }

    async fn backlog_for_table(
        &self,
        table: &str,
        source: &str,
        limit: u32,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_RECORD_COLUMNS_E} FROM events e
             LEFT JOIN {table} x
               ON x.source = e.source AND x.source_id = e.source_id
             WHERE e.source = ? AND x.source IS NULL
             ORDER BY e.start_utc, e.source_id
             LIMIT ?"
        ))
        .bind(source)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_record_from_row).collect()
    }

    // --- enrichment writes/reads ------------------------------------------

    pub async fn insert_detail_enrichment(
        &self,
        enrichment: &DetailPageEnrichment,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO detail_page_enrichments (source, source_id, detail_url,
                 registration_url, contact_name, contact_email, fetched_at, status, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (source, source_id) DO UPDATE SET
                 detail_url = excluded.detail_url,
                 registration_url = excluded.registration_url,
                 contact_name = excluded.contact_name,
                 contact_email = excluded.contact_email,
                 fetched_at = excluded.fetched_at,
                 status = excluded.status,
                 error = excluded.error",
        )
        .bind(&enrichment.source)
        .bind(&enrichment.source_id)
        .bind(&enrichment.detail_url)
        .bind(&enrichment.registration_url)
        .bind(&enrichment.contact_name)
        .bind(&enrichment.contact_email)
        .bind(enrichment.fetched_at)
        .bind(enrichment.status.as_str())
        .bind(&enrichment.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn detail_enrichments(&self) -> Result<Vec<DetailPageEnrichment>, StoreError> {
        let rows = sqlx::query(
            "SELECT source, source_id, detail_url, registration_url, contact_name,
                    contact_email, fetched_at, status, error
             FROM detail_page_enrichments ORDER BY source, source_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(detail_enrichment_from_row).collect()
    }

    pub async fn insert_categorization(
        &self,
        enrichment: &CategorizationEnrichment,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO categorization_enrichments (source, source_id, category,
                 rationale, confidence, created_at, status, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (source, source_id) DO UPDATE SET
                 category = excluded.category,
                 rationale = excluded.rationale,
                 confidence = excluded.confidence,
                 created_at = excluded.created_at,
                 status = excluded.status,
                 error = excluded.error",
        )
        .bind(&enrichment.source)
        .bind(&enrichment.source_id)
        .bind(enrichment.category.map(|c| c.as_str()))
        .bind(&enrichment.rationale)
        .bind(enrichment.confidence)
        .bind(enrichment.created_at)
        .bind(enrichment.status.as_str())
        .bind(&enrichment.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn categorizations(&self) -> Result<Vec<CategorizationEnrichment>, StoreError> {
        let rows = sqlx::query(
            "SELECT source, source_id, category, rationale, confidence, created_at,
                    status, error
             FROM categorization_enrichments ORDER BY source, source_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(categorization_from_row).collect()
    }

    pub async fn enrichment_progress(
        &self,
        kind: EnrichmentKind,
        source: Option<&str>,
    ) -> Result<EnrichmentProgress, StoreError> {
        let table = match kind {
            EnrichmentKind::DetailPage => "detail_page_enrichments",
            EnrichmentKind::Categorization => "categorization_enrichments",
        };
        let row = match source {
            Some(source) => {
                sqlx::query(&format!(
                    "SELECT
                         (SELECT COUNT(*) FROM {table} WHERE source = ?1) AS enriched,
                         (SELECT COUNT(*) FROM events WHERE source = ?1) AS total"
                ))
                .bind(source)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT
                         (SELECT COUNT(*) FROM {table}) AS enriched,
                         (SELECT COUNT(*) FROM events) AS total"
                ))
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(EnrichmentProgress {
            enriched: row.try_get::<i64, _>("enriched")? as u64,
            total: row.try_get::<i64, _>("total")? as u64,
        })
    }

    // --- canonical output -------------------------------------------------

    /// Replace the published canonical set atomically. Clusters are
    /// recomputed from scratch each run, so this is delete-and-insert
    /// inside one transaction.
    pub async fn publish_canonical(&self, events: &[CanonicalEvent]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM event_group_memberships")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM canonical_events")
            .execute(&mut *tx)
            .await?;

        for event in events {
            sqlx::query(
                "INSERT INTO canonical_events (canonical_id, title, start_utc, end_utc,
                     venue, address, url, cost, latitude, longitude, tags)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.canonical_id)
            .bind(&event.title)
            .bind(event.start)
            .bind(event.end)
            .bind(&event.venue)
            .bind(&event.address)
            .bind(&event.url)
            .bind(&event.cost)
            .bind(event.latitude)
            .bind(event.longitude)
            .bind(join_tags(&event.tags))
            .execute(&mut *tx)
            .await?;

            for (position, key) in event.source_events.iter().enumerate() {
                let Some((source, source_id)) = key.split_once(':') else {
                    return Err(StoreError::Corrupt(format!(
                        "membership key without source prefix: {key}"
                    )));
                };
                sqlx::query(
                    "INSERT INTO event_group_memberships (canonical_id, source, source_id, position)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(&event.canonical_id)
                .bind(source)
                .bind(source_id)
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn canonical_events(&self) -> Result<Vec<CanonicalEvent>, StoreError> {
        self.canonical_where("", None).await
    }

    /// Canonical events that have not ended yet.
    pub async fn future_canonical_events(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<CanonicalEvent>, StoreError> {
        self.canonical_where("WHERE end_utc >= ?", Some(now)).await
    }

    async fn canonical_where(
        &self,
        filter: &str,
        bind_now: Option<DateTime<Utc>>,
    ) -> Result<Vec<CanonicalEvent>, StoreError> {
        let sql = format!(
            "SELECT canonical_id, title, start_utc, end_utc, venue, address, url,
                    cost, latitude, longitude, tags
             FROM canonical_events {filter} ORDER BY start_utc, canonical_id"
        );
        let query = sqlx::query(&sql);
        let rows = match bind_now {
            Some(now) => query.bind(now).fetch_all(&self.pool).await?,
            None => query.fetch_all(&self.pool).await?,
        };

        let membership_rows = sqlx::query(
            "SELECT canonical_id, source, source_id FROM event_group_memberships
             ORDER BY canonical_id, position",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut memberships: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();
        for row in &membership_rows {
            let canonical_id: String = row.try_get("canonical_id")?;
            let source: String = row.try_get("source")?;
            let source_id: String = row.try_get("source_id")?;
            memberships
                .entry(canonical_id)
                .or_default()
                .push(format!("{source}:{source_id}"));
        }

        rows.iter()
            .map(|row| {
                let canonical_id: String = row.try_get("canonical_id")?;
                let source_events = memberships.remove(&canonical_id).unwrap_or_default();
                Ok(CanonicalEvent {
                    canonical_id,
                    title: row.try_get("title")?,
                    start: row.try_get("start_utc")?,
                    end: row.try_get("end_utc")?,
                    venue: row.try_get("venue")?,
                    address: row.try_get("address")?,
                    url: row.try_get("url")?,
                    cost: row.try_get("cost")?,
                    latitude: row.try_get("latitude")?,
                    longitude: row.try_get("longitude")?,
                    tags: split_tags(row.try_get::<String, _>("tags")?),
                    source_events,
                })
            })
            .collect()
    }

    // --- run stats --------------------------------------------------------

    pub async fn record_run(&self, stat: &RunStat) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pipeline_runs (id, stage, source, attempted, succeeded, failed, ran_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&stat.id)
        .bind(stat.stage.as_str())
        .bind(&stat.source)
        .bind(stat.attempted as i64)
        .bind(stat.succeeded as i64)
        .bind(stat.failed as i64)
        .bind(stat.ran_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunStat>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, stage, source, attempted, succeeded, failed, ran_at
             FROM pipeline_runs ORDER BY ran_at DESC, id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_stat_from_row).collect()
    }

    /// Most recent run per source for one stage; freshness reporting.
    pub async fn latest_runs_for_stage(
        &self,
        stage: PipelineStage,
    ) -> Result<Vec<RunStat>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, stage, source, attempted, succeeded, failed, ran_at
             FROM pipeline_runs WHERE stage = ? AND source IS NOT NULL
             ORDER BY ran_at DESC, id",
        )
        .bind(stage.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut seen = std::collections::HashSet::new();
        let mut latest = Vec::new();
        for row in &rows {
            let stat = run_stat_from_row(row)?;
            let source = stat.source.clone().unwrap_or_default();
            if seen.insert(source) {
                latest.push(stat);
            }
        }
        latest.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(latest)
    }
}

const SOURCE_RECORD_COLUMNS: &str = "source, source_id, title, start_utc, end_utc, venue, \
     address, url, cost, latitude, longitude, tags, same_as, payload";
const SOURCE_RECORD_COLUMNS_E: &str = "e.source, e.source_id, e.title, e.start_utc, e.end_utc, \
     e.venue, e.address, e.url, e.cost, e.latitude, e.longitude, e.tags, e.same_as, e.payload";

fn join_tags(tags: &[String]) -> String {
    tags.join(",")
}

fn split_tags(joined: String) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_status(value: &str) -> Result<EnrichmentStatus, StoreError> {
    EnrichmentStatus::parse(value)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown enrichment status: {value}")))
}

fn source_record_from_row(row: &SqliteRow) -> Result<SourceRecord, StoreError> {
    let payload = match row.try_get::<Option<String>, _>("payload")? {
        Some(text) => Some(
            serde_json::from_str(&text)
                .map_err(|e| StoreError::Corrupt(format!("payload is not JSON: {e}")))?,
        ),
        None => None,
    };
    Ok(SourceRecord {
        source: row.try_get("source")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        start: row.try_get("start_utc")?,
        end: row.try_get("end_utc")?,
        venue: row.try_get("venue")?,
        address: row.try_get("address")?,
        url: row.try_get("url")?,
        cost: row.try_get("cost")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        tags: split_tags(row.try_get::<String, _>("tags")?),
        same_as: row.try_get("same_as")?,
        payload,
    })
}

fn detail_enrichment_from_row(row: &SqliteRow) -> Result<DetailPageEnrichment, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(DetailPageEnrichment {
        source: row.try_get("source")?,
        source_id: row.try_get("source_id")?,
        detail_url: row.try_get("detail_url")?,
        registration_url: row.try_get("registration_url")?,
        contact_name: row.try_get("contact_name")?,
        contact_email: row.try_get("contact_email")?,
        fetched_at: row.try_get("fetched_at")?,
        status: parse_status(&status)?,
        error: row.try_get("error")?,
    })
}

fn categorization_from_row(row: &SqliteRow) -> Result<CategorizationEnrichment, StoreError> {
    let status: String = row.try_get("status")?;
    let category = match row.try_get::<Option<String>, _>("category")? {
        Some(text) => Some(
            EventCategory::parse(&text)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown category: {text}")))?,
        ),
        None => None,
    };
    Ok(CategorizationEnrichment {
        source: row.try_get("source")?,
        source_id: row.try_get("source_id")?,
        category,
        rationale: row.try_get("rationale")?,
        confidence: row.try_get("confidence")?,
        created_at: row.try_get("created_at")?,
        status: parse_status(&status)?,
        error: row.try_get("error")?,
    })
}

fn run_stat_from_row(row: &SqliteRow) -> Result<RunStat, StoreError> {
    let stage: String = row.try_get("stage")?;
    Ok(RunStat {
        id: row.try_get("id")?,
        stage: PipelineStage::parse(&stage)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown stage: {stage}")))?,
        source: row.try_get("source")?,
        attempted: row.try_get::<i64, _>("attempted")? as u64,
        succeeded: row.try_get::<i64, _>("succeeded")? as u64,
        failed: row.try_get::<i64, _>("failed")? as u64,
        ran_at: row.try_get("ran_at")?,
    })
}
