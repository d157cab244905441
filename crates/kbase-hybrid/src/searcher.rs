use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kbase_cache::ContentCache;
use kbase_core::config::SearchSettings;
use kbase_core::{
    Error, ModeSource, Reranker, Result, Retriever, SearchMode, SearchQuery, SearchResult, StoreRole, VectorStore,
    META_DEGRADED, META_SERVED_BY,
};

use crate::merge::{merge_passes, sort_by_score};

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Candidate multiplier for reranking and for each hybrid pass.
    pub overfetch_factor: usize,
    /// Bound on every store and reranker call.
    pub io_timeout: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self { Self::from(&SearchSettings::default()) }
}

impl From<&SearchSettings> for SearchOptions {
    fn from(s: &SearchSettings) -> Self {
        Self { overfetch_factor: s.overfetch_factor.max(1), io_timeout: Duration::from_millis(s.io_timeout_ms) }
    }
}

/// Answers [`SearchQuery`]s against whichever store the mode source names.
pub struct HybridSearcher {
    cache: ContentCache,
    primary: Arc<dyn VectorStore>,
    fallback: Arc<dyn VectorStore>,
    mode: Arc<dyn ModeSource>,
    reranker: Option<Arc<dyn Reranker>>,
    options: SearchOptions,
}

impl HybridSearcher {
    pub fn new(cache: ContentCache, primary: Arc<dyn VectorStore>, fallback: Arc<dyn VectorStore>, mode: Arc<dyn ModeSource>) -> Self {
        Self { cache, primary, fallback, mode, reranker: None, options: SearchOptions::default() }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        query.validate()?;
        if query.text().trim().is_empty() {
            return Ok(Vec::new());
        }
        let role = self.mode.resolve_mode().await.store_role();
        let vector = self.cache.get_or_compute(query.text()).await?;

        let (role, outcome) = match self.run(role, query, &vector).await {
            Err(e) if e.is_transient() && role == StoreRole::Primary => {
                tracing::warn!(error = %e, "primary failed mid-query; retrying on fallback");
                self.mode.report_primary_failure(&e.to_string());
                (StoreRole::Fallback, self.run(StoreRole::Fallback, query, &vector).await)
            }
            other => (role, other),
        };
        let mut results = outcome?;
        for r in &mut results {
            r.metadata.insert(META_SERVED_BY.to_string(), role.as_str().to_string());
            r.metadata.insert(META_DEGRADED.to_string(), (role == StoreRole::Fallback).to_string());
        }
        tracing::debug!(store = role.as_str(), mode = ?query.mode(), hits = results.len(), "search complete");
        Ok(results)
    }

    fn store(&self, role: StoreRole) -> &Arc<dyn VectorStore> {
        match role {
            StoreRole::Primary => &self.primary,
            StoreRole::Fallback => &self.fallback,
        }
    }

    async fn run(&self, role: StoreRole, query: &SearchQuery, vector: &[f32]) -> Result<Vec<SearchResult>> {
        let store = self.store(role);
        let top_k = query.top_k();
        let overfetched = top_k.saturating_mul(self.options.overfetch_factor);
        let candidates = if self.reranker.is_some() { overfetched } else { top_k };

        let mut results: Vec<SearchResult> = match query.mode() {
            SearchMode::Semantic => {
                let hits = self.bounded("dense search", store.search(vector, query.filters(), candidates, query.score_threshold())).await?;
                hits.into_iter().map(SearchResult::from).collect()
            }
            SearchMode::Hybrid => {
                let (dense, sparse) = futures::try_join!(
                    self.bounded("dense search", store.search(vector, query.filters(), overfetched, 0.0)),
                    self.bounded("keyword search", store.keyword_search(query.text(), query.filters(), overfetched)),
                )?;
                let mut merged = merge_passes(dense, sparse, query.sparse_weight());
                merged.retain(|r| r.score >= query.score_threshold());
                merged.truncate(candidates);
                merged
            }
        };

        if let Some(reranker) = &self.reranker {
            if !results.is_empty() {
                match self.bounded("rerank", reranker.rerank(query.text(), results.clone(), top_k)).await {
                    Ok(mut reranked) => {
                        sort_by_score(&mut reranked);
                        results = reranked;
                    }
                    Err(e) => tracing::warn!(error = %e, "reranker failed; keeping retrieval order"),
                }
            }
        }
        results.truncate(top_k);
        Ok(results)
    }

    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.options.io_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(Error::timed_out(what, self.options.io_timeout)),
        }
    }
}

#[async_trait]
impl Retriever for HybridSearcher {
    async fn retrieve(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> { self.search(query).await }
}
