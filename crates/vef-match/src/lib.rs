//! Cross-source duplicate detection and canonical-record selection.
//!
//! The engine scores record pairs with independent feature comparisons
//! combined as fixed log-odds weights, clusters matches into connected
//! components, and selects one canonical representative per cluster by
//! source precedence. Blocking keeps the pair set far below O(N²): only
//! pairs sharing an event date or a normalized title are compared, and the
//! decision threshold is conservative because one spurious edge merges two
//! real events.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use strsim::jaro_winkler;
use tracing::debug;
use uuid::Uuid;

use vef_core::urls::normalize_url;
use vef_core::{
    CanonicalEvent, CategorizationEnrichment, DetailPageEnrichment, EnrichmentStatus,
    EventCategory, SourceRecord,
};

pub const CRATE_NAME: &str = "vef-match";

#[derive(Debug, Clone, Copy)]
pub struct MatchConfig {
    pub title_threshold: f64,
    pub address_threshold: f64,
    /// Minimum combined probability for a pair to count as a match.
    pub match_threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            title_threshold: 0.7,
            address_threshold: 0.75,
            match_threshold: 0.9,
        }
    }
}

// Log-odds contributions per feature outcome. Shared-URL evidence reflects an
// explicit cross-source link and must dominate every fuzzy tier combined;
// date/title agreement is the next tier; address fuzz the weakest.
const PRIOR_LOGIT: f64 = -4.0;
const W_SHARED_URL: f64 = 12.0;
const W_TITLE_STRONG: f64 = 4.0;
const W_SAME_DAY: f64 = 3.0;
const W_DIFFERENT_DAY: f64 = -1.5;
const W_SAME_START_TIME: f64 = 2.0;
const W_DIFFERENT_START_TIME: f64 = -1.0;
const W_ADDRESS_STRONG: f64 = 1.5;
const W_CATEGORY_AGREE: f64 = 0.5;
const W_CATEGORY_DISAGREE: f64 = -0.5;

/// One source record joined with whatever enrichment exists for it.
#[derive(Debug, Clone)]
pub struct MatchRecord {
    pub record: SourceRecord,
    /// Normalized URL identity set: own url, same_as, enrichment-derived
    /// registration link.
    pub urls: BTreeSet<String>,
    pub category: Option<EventCategory>,
}

impl MatchRecord {
    pub fn from_record(record: SourceRecord) -> Self {
        let mut urls = BTreeSet::new();
        urls.insert(normalize_url(&record.url));
        if let Some(same_as) = &record.same_as {
            urls.insert(normalize_url(same_as));
        }
        Self {
            record,
            urls,
            category: None,
        }
    }
}

/// Join raw records with enrichment rows into match inputs. Only successful
/// enrichment rows contribute signal.
pub fn join_enrichment(
    records: Vec<SourceRecord>,
    details: &[DetailPageEnrichment],
    categorizations: &[CategorizationEnrichment],
) -> Vec<MatchRecord> {
    let mut aux_urls: HashMap<(String, String), &DetailPageEnrichment> = HashMap::new();
    for detail in details {
        if detail.status == EnrichmentStatus::Success {
            aux_urls.insert((detail.source.clone(), detail.source_id.clone()), detail);
        }
    }
    let mut categories: HashMap<(String, String), EventCategory> = HashMap::new();
    for cat in categorizations {
        if cat.status == EnrichmentStatus::Success {
            if let Some(category) = cat.category {
                categories.insert((cat.source.clone(), cat.source_id.clone()), category);
            }
        }
    }

    records
        .into_iter()
        .map(|record| {
            let key = (record.source.clone(), record.source_id.clone());
            let mut joined = MatchRecord::from_record(record);
            if let Some(detail) = aux_urls.get(&key) {
                if let Some(registration_url) = &detail.registration_url {
                    joined.urls.insert(normalize_url(registration_url));
                }
            }
            joined.category = categories.get(&key).copied();
            joined
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimilarityLevel {
    Strong,
    Weak,
    /// Field absent on at least one side: contributes no signal at all.
    Missing,
}

/// Per-feature comparison outcomes for one record pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchSignal {
    pub shared_url: bool,
    pub title: SimilarityLevel,
    pub same_day: bool,
    /// None when either record is date-only.
    pub same_start_time: Option<bool>,
    pub address: SimilarityLevel,
    /// None unless both records are categorized.
    pub category_agreement: Option<bool>,
}

impl MatchSignal {
    pub fn logit(&self) -> f64 {
        let mut logit = PRIOR_LOGIT;
        if self.shared_url {
            logit += W_SHARED_URL;
        }
        if self.title == SimilarityLevel::Strong {
            logit += W_TITLE_STRONG;
        }
        logit += if self.same_day {
            W_SAME_DAY
        } else {
            W_DIFFERENT_DAY
        };
        match self.same_start_time {
            Some(true) => logit += W_SAME_START_TIME,
            Some(false) => logit += W_DIFFERENT_START_TIME,
            None => {}
        }
        if self.address == SimilarityLevel::Strong {
            logit += W_ADDRESS_STRONG;
        }
        match self.category_agreement {
            Some(true) => logit += W_CATEGORY_AGREE,
            Some(false) => logit += W_CATEGORY_DISAGREE,
            None => {}
        }
        logit
    }

    pub fn probability(&self) -> f64 {
        1.0 / (1.0 + (-self.logit()).exp())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredPair {
    pub a: usize,
    pub b: usize,
    pub probability: f64,
    pub signal: MatchSignal,
}

/// Lowercase, strip punctuation, collapse whitespace. Used both as a
/// blocking key and as the input to title similarity.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchEngine {
    config: MatchConfig,
}

impl MatchEngine {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    /// Score every blocked pair. Indices refer into `records`.
    pub fn score_pairs(&self, records: &[MatchRecord]) -> Vec<ScoredPair> {
        let pairs = blocked_pairs(records);
        debug!(
            records = records.len(),
            blocked_pairs = pairs.len(),
            "scoring blocked pairs"
        );
        pairs
            .into_iter()
            .map(|(a, b)| {
                let signal = self.compare(&records[a], &records[b]);
                ScoredPair {
                    a,
                    b,
                    probability: signal.probability(),
                    signal,
                }
            })
            .collect()
    }

    /// Pairs whose probability clears the decision threshold.
    pub fn match_pairs(&self, records: &[MatchRecord]) -> Vec<(usize, usize)> {
        self.score_pairs(records)
            .into_iter()
            .filter(|pair| pair.probability >= self.config.match_threshold)
            .map(|pair| (pair.a, pair.b))
            .collect()
    }

    pub fn compare(&self, a: &MatchRecord, b: &MatchRecord) -> MatchSignal {
        let shared_url = a.urls.intersection(&b.urls).next().is_some();

        let title_a = normalize_text(&a.record.title);
        let title_b = normalize_text(&b.record.title);
        let title = if title_a.is_empty() || title_b.is_empty() {
            SimilarityLevel::Missing
        } else if jaro_winkler(&title_a, &title_b) >= self.config.title_threshold {
            SimilarityLevel::Strong
        } else {
            SimilarityLevel::Weak
        };

        let same_day = a.record.start.date_naive() == b.record.start.date_naive();
        let same_start_time = if a.record.has_time_info() && b.record.has_time_info() {
            Some(a.record.start == b.record.start)
        } else {
            None
        };

        let address = match (&a.record.address, &b.record.address) {
            (Some(addr_a), Some(addr_b)) => {
                let addr_a = normalize_text(addr_a);
                let addr_b = normalize_text(addr_b);
                if addr_a.is_empty() || addr_b.is_empty() {
                    SimilarityLevel::Missing
                } else if jaro_winkler(&addr_a, &addr_b) >= self.config.address_threshold {
                    SimilarityLevel::Strong
                } else {
                    SimilarityLevel::Weak
                }
            }
            _ => SimilarityLevel::Missing,
        };

        let category_agreement = match (a.category, b.category) {
            (Some(cat_a), Some(cat_b)) => Some(cat_a == cat_b),
            _ => None,
        };

        MatchSignal {
            shared_url,
            title,
            same_day,
            same_start_time,
            address,
            category_agreement,
        }
    }
}

/// Candidate pairs that agree exactly on at least one cheap key: event date
/// or normalized title. Records from the same source are never paired with
/// themselves but may pair within a source (sources do repost).
fn blocked_pairs(records: &[MatchRecord]) -> BTreeSet<(usize, usize)> {
    let mut by_date: HashMap<String, Vec<usize>> = HashMap::new();
    let mut by_title: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, item) in records.iter().enumerate() {
        by_date
            .entry(item.record.start.date_naive().to_string())
            .or_default()
            .push(index);
        let title = normalize_text(&item.record.title);
        if !title.is_empty() {
            by_title.entry(title).or_default().push(index);
        }
    }

    let mut pairs = BTreeSet::new();
    for bucket in by_date.values().chain(by_title.values()) {
        for i in 0..bucket.len() {
            for j in (i + 1)..bucket.len() {
                pairs.insert((bucket[i].min(bucket[j]), bucket[i].max(bucket[j])));
            }
        }
    }
    pairs
}

// ---------------------------------------------------------------------------
// Clustering
// ---------------------------------------------------------------------------

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u32>,
}

impl UnionFind {
    fn new(count: usize) -> Self {
        Self {
            parent: (0..count).collect(),
            rank: vec![0; count],
        }
    }

    fn find(&mut self, node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = node;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return;
        }
        if self.rank[root_a] < self.rank[root_b] {
            self.parent[root_a] = root_b;
        } else if self.rank[root_a] > self.rank[root_b] {
            self.parent[root_b] = root_a;
        } else {
            self.parent[root_b] = root_a;
            self.rank[root_a] += 1;
        }
    }
}

/// Connected components over matched pairs. Every index in `0..count`
/// appears in exactly one cluster; unmatched records become singletons.
/// Transitivity is intentional: blocking means not every pair was directly
/// compared.
pub fn build_clusters(count: usize, matches: &[(usize, usize)]) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::new(count);
    for &(a, b) in matches {
        uf.union(a, b);
    }

    let mut by_root: HashMap<usize, Vec<usize>> = HashMap::new();
    for index in 0..count {
        by_root.entry(uf.find(index)).or_default().push(index);
    }

    let mut clusters: Vec<Vec<usize>> = by_root.into_values().collect();
    for cluster in &mut clusters {
        cluster.sort_unstable();
    }
    clusters.sort_by_key(|cluster| cluster[0]);
    clusters
}

// ---------------------------------------------------------------------------
// Canonical selection
// ---------------------------------------------------------------------------

/// Fixed source priority: lower rank wins. Sources absent from the table
/// sort last.
#[derive(Debug, Clone, Default)]
pub struct SourcePrecedence {
    ranks: HashMap<String, u32>,
}

impl SourcePrecedence {
    pub fn from_ranks(ranks: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            ranks: ranks.into_iter().collect(),
        }
    }

    pub fn rank(&self, source: &str) -> u32 {
        self.ranks.get(source).copied().unwrap_or(u32::MAX)
    }
}

/// One cluster after selection: the merged canonical event plus the
/// subordinate source records, each pointing at the canonical URL.
#[derive(Debug, Clone)]
pub struct ClusterSelection {
    pub canonical: CanonicalEvent,
    pub subordinates: Vec<SourceRecord>,
}

/// Precedence-based canonical selection. The highest-priority member
/// represents the cluster; ties break by field completeness, then by
/// `(source, source_id)` so selection is deterministic.
#[derive(Debug, Clone, Default)]
pub struct CanonicalSelector {
    precedence: SourcePrecedence,
}

impl CanonicalSelector {
    pub fn new(precedence: SourcePrecedence) -> Self {
        Self { precedence }
    }

    /// Deterministic canonical id over the member key set.
    pub fn canonical_id(member_keys: &[String]) -> String {
        let mut keys = member_keys.to_vec();
        keys.sort();
        Uuid::new_v5(&Uuid::NAMESPACE_URL, keys.join("|").as_bytes()).to_string()
    }

    pub fn select(&self, members: &[MatchRecord]) -> ClusterSelection {
        let order = self.precedence_order(members);
        let rep = &members[order[0]].record;

        let member_keys: Vec<String> = order
            .iter()
            .map(|&index| members[index].record.key())
            .collect();

        // The representative's own cross-source link is the better
        // registration URL when present. One hop only, never transitive.
        let url = match &rep.same_as {
            Some(same_as) => normalize_url(same_as),
            None => normalize_url(&rep.url),
        };

        let (start, end) = self.merged_times(rep, members, &order);

        let mut tags: Vec<String> = Vec::new();
        for &index in &order {
            for tag in &members[index].record.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
        }

        let canonical = CanonicalEvent {
            canonical_id: Self::canonical_id(&member_keys),
            title: rep.title.clone(),
            start,
            end,
            venue: first_present(members, &order, |r| r.venue.clone()),
            address: first_present(members, &order, |r| r.address.clone()),
            url: url.clone(),
            cost: first_present(members, &order, |r| r.cost.clone()),
            latitude: first_present(members, &order, |r| r.latitude),
            longitude: first_present(members, &order, |r| r.longitude),
            tags,
            source_events: member_keys,
        };

        let subordinates = order[1..]
            .iter()
            .map(|&index| {
                let mut record = members[index].record.clone();
                record.same_as = Some(url.clone());
                record
            })
            .collect();

        ClusterSelection {
            canonical,
            subordinates,
        }
    }

    /// Member indices best-first: precedence rank, then completeness, then
    /// key order.
    fn precedence_order(&self, members: &[MatchRecord]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..members.len()).collect();
        order.sort_by_key(|&index| {
            let record = &members[index].record;
            (
                self.precedence.rank(&record.source),
                record.is_date_only(),
                missing_field_count(record),
                record.key(),
            )
        });
        order
    }

    /// Date-only representatives borrow start/end times from the best
    /// member that has time info on the same date.
    fn merged_times(
        &self,
        rep: &SourceRecord,
        members: &[MatchRecord],
        order: &[usize],
    ) -> (chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>) {
        if rep.has_time_info() {
            return (rep.start, rep.end);
        }
        for &index in order {
            let candidate = &members[index].record;
            if candidate.has_time_info()
                && candidate.start.date_naive() == rep.start.date_naive()
            {
                return (candidate.start, candidate.end);
            }
        }
        (rep.start, rep.end)
    }
}

fn missing_field_count(record: &SourceRecord) -> u32 {
    let mut missing = 0;
    if record.venue.is_none() {
        missing += 1;
    }
    if record.address.is_none() {
        missing += 1;
    }
    if record.cost.is_none() {
        missing += 1;
    }
    if record.latitude.is_none() || record.longitude.is_none() {
        missing += 1;
    }
    missing
}

fn first_present<T>(
    members: &[MatchRecord],
    order: &[usize],
    get: impl Fn(&SourceRecord) -> Option<T>,
) -> Option<T> {
    order.iter().find_map(|&index| get(&members[index].record))
}

/// Full reconciliation: score, cluster, select. Returns one selection per
/// cluster, singletons included.
pub fn reconcile(
    records: &[MatchRecord],
    engine: &MatchEngine,
    selector: &CanonicalSelector,
) -> Vec<ClusterSelection> {
    let matches = engine.match_pairs(records);
    let clusters = build_clusters(records.len(), &matches);
    clusters
        .iter()
        .map(|cluster| {
            let members: Vec<MatchRecord> =
                cluster.iter().map(|&index| records[index].clone()).collect();
            selector.select(&members)
        })
        .collect()
}
