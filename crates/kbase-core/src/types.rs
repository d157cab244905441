//! Domain types shared by the cache, stores, searcher, assessor and sync manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

pub type ChunkId = String;
/// Exact-match metadata. Ordered so results and snapshots compare stably.
pub type Meta = BTreeMap<String, String>;

/// Metadata key naming the store that served a search.
pub const META_SERVED_BY: &str = "served_by";
/// Metadata key set to `"true"` when results came from the Fallback store.
pub const META_DEGRADED: &str = "degraded";

/// A unit of indexed text with its embedding vector and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub content: String,
    #[serde(default)]
    pub metadata: Meta,
    pub vector: Vec<f32>,
}

/// A hit as returned by a store pass. `similarity` is in `[0, 1]`, higher is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub id: ChunkId,
    pub content: String,
    pub metadata: Meta,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Semantic,
    Hybrid,
}

/// An immutable, validated search request.
///
/// Deserialization goes through [`SearchQueryBuilder::build`], so a decoded
/// query obeys the same bounds as a constructed one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SearchQueryBuilder")]
pub struct SearchQuery {
    text: String,
    filters: Meta,
    top_k: usize,
    score_threshold: f32,
    mode: SearchMode,
    sparse_weight: f32,
}

impl SearchQuery {
    /// Semantic query with no filters and no threshold.
    pub fn semantic(text: impl Into<String>, top_k: usize) -> Result<Self> {
        SearchQueryBuilder::new(text).top_k(top_k).build()
    }

    pub fn builder(text: impl Into<String>) -> SearchQueryBuilder { SearchQueryBuilder::new(text) }

    pub fn text(&self) -> &str { &self.text }
    pub fn filters(&self) -> &Meta { &self.filters }
    pub fn top_k(&self) -> usize { self.top_k }
    pub fn score_threshold(&self) -> f32 { self.score_threshold }
    pub fn mode(&self) -> SearchMode { self.mode }
    pub fn sparse_weight(&self) -> f32 { self.sparse_weight }

    /// Bounds every query must satisfy before it reaches a store.
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::InvalidArgument("top_k must be greater than zero".into()));
        }
        if !unit_interval(self.score_threshold) {
            return Err(Error::InvalidArgument(format!("score_threshold {} is outside [0, 1]", self.score_threshold)));
        }
        if !unit_interval(self.sparse_weight) {
            return Err(Error::InvalidArgument(format!("sparse_weight {} is outside [0, 1]", self.sparse_weight)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQueryBuilder {
    text: String,
    #[serde(default)]
    filters: Meta,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    score_threshold: f32,
    #[serde(default)]
    mode: SearchMode,
    #[serde(default = "default_sparse_weight")]
    sparse_weight: f32,
}

fn default_top_k() -> usize { 10 }

fn default_sparse_weight() -> f32 { 0.3 }

impl SearchQueryBuilder {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            filters: Meta::new(),
            top_k: default_top_k(),
            score_threshold: 0.0,
            mode: SearchMode::Semantic,
            sparse_weight: default_sparse_weight(),
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self { self.top_k = top_k; self }
    pub fn score_threshold(mut self, threshold: f32) -> Self { self.score_threshold = threshold; self }
    pub fn mode(mut self, mode: SearchMode) -> Self { self.mode = mode; self }

    /// Switch to hybrid mode with the given sparse weight.
    pub fn hybrid(mut self, sparse_weight: f32) -> Self {
        self.mode = SearchMode::Hybrid;
        self.sparse_weight = sparse_weight;
        self
    }

    pub fn filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn filters(mut self, filters: Meta) -> Self { self.filters = filters; self }

    pub fn build(self) -> Result<SearchQuery> {
        let query = SearchQuery {
            text: self.text,
            filters: self.filters,
            top_k: self.top_k,
            score_threshold: self.score_threshold,
            mode: self.mode,
            sparse_weight: self.sparse_weight,
        };
        query.validate()?;
        Ok(query)
    }
}

impl TryFrom<SearchQueryBuilder> for SearchQuery {
    type Error = Error;

    fn try_from(builder: SearchQueryBuilder) -> Result<Self> { builder.build() }
}

pub(crate) fn unit_interval(v: f32) -> bool { (0.0..=1.0).contains(&v) }

/// A ranked search result.
///
/// Results of one call are ordered by `rerank_score` when present, else by `score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: ChunkId,
    pub content: String,
    pub metadata: Meta,
    /// Post-merge, pre-rerank score.
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

impl SearchResult {
    /// The score the result is ranked by.
    pub fn rank_score(&self) -> f32 { self.rerank_score.unwrap_or(self.score) }

    pub fn is_degraded(&self) -> bool { self.metadata.get(META_DEGRADED).is_some_and(|v| v == "true") }

    pub fn served_by(&self) -> Option<StoreRole> {
        match self.metadata.get(META_SERVED_BY).map(String::as_str) {
            Some("primary") => Some(StoreRole::Primary),
            Some("fallback") => Some(StoreRole::Fallback),
            _ => None,
        }
    }
}

impl From<RawResult> for SearchResult {
    fn from(raw: RawResult) -> Self {
        Self { id: raw.id, content: raw.content, metadata: raw.metadata, score: raw.similarity, rerank_score: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreRole {
    Primary,
    Fallback,
}

impl StoreRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Online,
    Degraded,
}

impl SyncMode {
    pub fn store_role(self) -> StoreRole {
        match self {
            Self::Online => StoreRole::Primary,
            Self::Degraded => StoreRole::Fallback,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    RolledBack,
}

/// Outcome of one `sync()` call. Failed syncs are reported, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub items_copied: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Failover and replication state, owned by the sync manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub mode: SyncMode,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub in_flight: bool,
    pub primary_reachable: bool,
    pub phase: SyncPhase,
    pub last_result: Option<SyncResult>,
}

/// Tunables for the coverage assessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    pub similarity_threshold: f32,
    pub high_confidence_threshold: f32,
    pub confidence_escalation_threshold: f32,
    pub confidence_medium_threshold: f32,
    pub n_results: usize,
    pub similarity_weight: f32,
    pub entropy_weight: f32,
    pub count_weight: f32,
    /// Maximum number of areas searched at once.
    pub concurrency: usize,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            high_confidence_threshold: 0.3,
            confidence_escalation_threshold: 0.7,
            confidence_medium_threshold: 0.4,
            n_results: 10,
            similarity_weight: 0.5,
            entropy_weight: 0.3,
            count_weight: 0.2,
            concurrency: 8,
        }
    }
}

impl CoverageConfig {
    pub fn validate(&self) -> Result<()> {
        let bounded = [
            ("similarity_threshold", self.similarity_threshold),
            ("high_confidence_threshold", self.high_confidence_threshold),
            ("confidence_escalation_threshold", self.confidence_escalation_threshold),
            ("confidence_medium_threshold", self.confidence_medium_threshold),
            ("similarity_weight", self.similarity_weight),
            ("entropy_weight", self.entropy_weight),
            ("count_weight", self.count_weight),
        ];
        for (name, value) in bounded {
            if !unit_interval(value) {
                return Err(Error::Configuration(format!("coverage.{name} = {value} is outside [0, 1]")));
            }
        }
        let sum = self.similarity_weight + self.entropy_weight + self.count_weight;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::Configuration(format!("coverage weights must sum to 1.0, got {sum}")));
        }
        if self.n_results == 0 {
            return Err(Error::Configuration("coverage.n_results must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Configuration("coverage.concurrency must be at least 1".into()));
        }
        Ok(())
    }
}
