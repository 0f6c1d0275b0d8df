//! Core domain model for VEF: source records, enrichment records,
//! canonical events, and pipeline run stats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod urls;

pub const CRATE_NAME: &str = "vef-core";

/// One listing as seen from one source. `(source, source_id)` is globally
/// unique and stable across re-fetches; upserts update fields in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub url: String,
    pub cost: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// URL of the same event on another source, when known upstream.
    pub same_as: Option<String>,
    /// Opaque source-specific structured payload.
    pub payload: Option<serde_json::Value>,
}

impl SourceRecord {
    /// Stable `source:source_id` provenance key.
    pub fn key(&self) -> String {
        format!("{}:{}", self.source, self.source_id)
    }

    /// Zero duration means the source only published a date, not a time.
    pub fn has_time_info(&self) -> bool {
        self.start != self.end
    }

    pub fn is_date_only(&self) -> bool {
        !self.has_time_info()
    }
}

/// The two independent enrichment streams. Each kind has its own table and
/// its own backlog; they share nothing but the `(source, source_id)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnrichmentKind {
    DetailPage,
    Categorization,
}

impl EnrichmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentKind::DetailPage => "detail_page",
            EnrichmentKind::Categorization => "categorization",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrichmentStatus {
    Success,
    Failed,
    Pending,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Success => "success",
            EnrichmentStatus::Failed => "failed",
            EnrichmentStatus::Pending => "pending",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(EnrichmentStatus::Success),
            "failed" => Some(EnrichmentStatus::Failed),
            "pending" => Some(EnrichmentStatus::Pending),
            _ => None,
        }
    }
}

/// Result of fetching and parsing a record's detail page. Written once per
/// `(source, source_id)`; a failed row is terminal until an operator
/// explicitly clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailPageEnrichment {
    pub source: String,
    pub source_id: String,
    pub detail_url: String,
    /// Cross-source registration link found on the page, normalized.
    pub registration_url: Option<String>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub status: EnrichmentStatus,
    pub error: Option<String>,
}

/// Standardized event categories assigned by the categorization collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCategory {
    VolunteerParks,
    VolunteerLitter,
    SocialEvent,
    Concert,
    Other,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::VolunteerParks => "volunteer/parks",
            EventCategory::VolunteerLitter => "volunteer/litter",
            EventCategory::SocialEvent => "social_event",
            EventCategory::Concert => "concert",
            EventCategory::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "volunteer/parks" => Some(EventCategory::VolunteerParks),
            "volunteer/litter" => Some(EventCategory::VolunteerLitter),
            "social_event" => Some(EventCategory::SocialEvent),
            "concert" => Some(EventCategory::Concert),
            "other" => Some(EventCategory::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationEnrichment {
    pub source: String,
    pub source_id: String,
    pub category: Option<EventCategory>,
    pub rationale: Option<String>,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub status: EnrichmentStatus,
    pub error: Option<String>,
}

/// Canonical event merged from one cluster of source records. Published
/// output contains these only; subordinate records stay internal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub canonical_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub venue: Option<String>,
    pub address: Option<String>,
    /// Preferred registration URL.
    pub url: String,
    pub cost: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// `source:source_id` keys of every cluster member, canonical first.
    pub source_events: Vec<String>,
}

impl CanonicalEvent {
    pub fn iter_source_events(&self) -> impl Iterator<Item = (&str, &str)> {
        self.source_events
            .iter()
            .filter_map(|key| key.split_once(':'))
    }

    pub fn has_time_info(&self) -> bool {
        self.start != self.end
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    Ingest,
    EnrichDetails,
    Categorize,
    Reconcile,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Ingest => "ingest",
            PipelineStage::EnrichDetails => "enrich-details",
            PipelineStage::Categorize => "categorize",
            PipelineStage::Reconcile => "reconcile",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ingest" => Some(PipelineStage::Ingest),
            "enrich-details" => Some(PipelineStage::EnrichDetails),
            "categorize" => Some(PipelineStage::Categorize),
            "reconcile" => Some(PipelineStage::Reconcile),
            _ => None,
        }
    }

    pub fn all() -> [PipelineStage; 4] {
        [
            PipelineStage::Ingest,
            PipelineStage::EnrichDetails,
            PipelineStage::Categorize,
            PipelineStage::Reconcile,
        ]
    }
}

/// Per-stage, per-source execution record. Immutable after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStat {
    pub id: String,
    pub stage: PipelineStage,
    pub source: Option<String>,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub ran_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mk_record(start_hour: u32, end_hour: u32) -> SourceRecord {
        SourceRecord {
            source: "SPR".into(),
            source_id: "spr-1".into(),
            title: "Lincoln Park Work Party".into(),
            start: Utc.with_ymd_and_hms(2024, 6, 15, start_hour, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 6, 15, end_hour, 0, 0).unwrap(),
            venue: None,
            address: None,
            url: "https://example.org/event/1".into(),
            cost: None,
            latitude: None,
            longitude: None,
            tags: vec![],
            same_as: None,
            payload: None,
        }
    }

    #[test]
    fn zero_duration_means_date_only() {
        assert!(mk_record(0, 0).is_date_only());
        assert!(mk_record(10, 12).has_time_info());
    }

    #[test]
    fn provenance_key_is_source_and_id() {
        assert_eq!(mk_record(10, 12).key(), "SPR:spr-1");
    }

    #[test]
    fn category_round_trips_through_str() {
        for cat in [
            EventCategory::VolunteerParks,
            EventCategory::VolunteerLitter,
            EventCategory::SocialEvent,
            EventCategory::Concert,
            EventCategory::Other,
        ] {
            assert_eq!(EventCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(EventCategory::parse("landscaping"), None);
    }

    #[test]
    fn canonical_source_events_split_on_first_colon() {
        let canonical = CanonicalEvent {
            canonical_id: "c1".into(),
            title: "t".into(),
            start: Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
            venue: None,
            address: None,
            url: "https://example.org".into(),
            cost: None,
            latitude: None,
            longitude: None,
            tags: vec![],
            source_events: vec!["GSP:42030".into(), "SPR:a:b".into()],
        };
        let pairs: Vec<_> = canonical.iter_source_events().collect();
        assert_eq!(pairs, vec![("GSP", "42030"), ("SPR", "a:b")]);
    }
}
