//! Seams between the engine and its collaborators.
//!
//! Stores, providers and rerankers are injected as trait objects at
//! construction time; nothing in the engine inspects concrete types.

use async_trait::async_trait;

use crate::error::{EmbedError, Result};
use crate::types::{Chunk, Meta, RawResult, SearchQuery, SearchResult, SyncMode};

/// Turns text into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable model identity, used to namespace cached vectors.
    fn model_id(&self) -> &str;
    /// Embedding dimensionality (D).
    fn dim(&self) -> usize;
    /// Embed a batch; the output has one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedError>;

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| EmbedError::Unavailable("provider returned no vector".into()))
    }
}

/// External contract of a vector store engine.
///
/// `search` returns at most `top_k` items and excludes anything below
/// `score_threshold`. `health_check` callers bound it with a timeout.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Insert or replace chunks in the live generation.
    async fn insert(&self, items: &[Chunk]) -> Result<()>;

    /// Dense nearest-neighbour pass.
    async fn search(&self, vector: &[f32], filters: &Meta, top_k: usize, score_threshold: f32) -> Result<Vec<RawResult>>;

    /// Sparse keyword pass; similarities normalized to `[0, 1]`.
    async fn keyword_search(&self, text: &str, filters: &Meta, top_k: usize) -> Result<Vec<RawResult>>;

    async fn health_check(&self) -> bool;

    /// Page through the live generation in a stable order.
    async fn scan(&self, offset: usize, limit: usize) -> Result<Vec<Chunk>>;

    async fn count(&self) -> Result<usize>;
}

/// Identifier of an out-of-place store generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GenerationId(pub String);

impl std::fmt::Display for GenerationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Two-phase create-then-swap capability required of the Fallback store.
///
/// Reads only ever observe the live generation. A staged generation becomes
/// visible exactly when `promote` returns `Ok`; `discard` leaves the live
/// generation untouched.
#[async_trait]
pub trait GenerationalStore: VectorStore {
    async fn create_staging(&self) -> Result<GenerationId>;
    async fn write_staging(&self, generation: &GenerationId, items: &[Chunk]) -> Result<()>;
    /// Atomically make `generation` live and drop the previous one.
    async fn promote(&self, generation: &GenerationId) -> Result<()>;
    async fn discard(&self, generation: &GenerationId) -> Result<()>;
    async fn live_generation(&self) -> Result<Option<GenerationId>>;
}

/// Second-pass reordering of a candidate set.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Returns at most `top_n` candidates with `rerank_score` set.
    async fn rerank(&self, query: &str, candidates: Vec<SearchResult>, top_n: usize) -> Result<Vec<SearchResult>>;
}

/// Anything that can answer a [`SearchQuery`].
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &SearchQuery) -> Result<Vec<SearchResult>>;
}

/// Tells the searcher which store is authoritative right now.
#[async_trait]
pub trait ModeSource: Send + Sync {
    /// Current mode, refreshing the Primary health check if it is stale.
    async fn resolve_mode(&self) -> SyncMode;
    /// Record a transient Primary failure observed outside a health check.
    fn report_primary_failure(&self, reason: &str);
}
