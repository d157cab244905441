//! Wires configuration into a running engine: embedding provider, cache,
//! both stores, failover monitor, searcher and sync manager.
use async_trait::async_trait;
use std::sync::Arc;

use kbase_cache::ContentCache;
use kbase_core::config::{Settings, StoreSettings};
use kbase_core::{Chunk, Error, Meta, RawResult, Result, SearchQuery, VectorStore};
use kbase_coverage::CoverageAssessor;
use kbase_embed::provider_from_settings;
use kbase_hybrid::{HybridSearcher, LexicalReranker, SearchOptions};
use kbase_sync::{FailoverMonitor, SyncManager, SyncStateHandle};
use kbase_vector::{LanceCacheStore, LanceStore};

pub struct Engine {
    pub settings: Settings,
    pub cache: ContentCache,
    pub primary: Arc<dyn VectorStore>,
    pub fallback: Arc<LanceStore>,
    pub searcher: Arc<HybridSearcher>,
    pub sync: SyncManager,
}

impl Engine {
    pub async fn open(settings: Settings) -> Result<Self> {
        let provider = provider_from_settings(&settings.embedding)?;
        let dim = provider.dim();
        let cache_store = LanceCacheStore::open(&settings.cache, dim).await?;
        let cache = ContentCache::with_settings(provider, Arc::new(cache_store), &settings.embedding, settings.cache.max_bytes);

        let primary = open_primary(&settings.primary, dim).await?;
        let fallback = Arc::new(LanceStore::open("fallback", &settings.fallback, dim).await?);

        let monitor = Arc::new(FailoverMonitor::new(primary.clone(), SyncStateHandle::new(), &settings.health));
        let mut searcher = HybridSearcher::new(cache.clone(), primary.clone(), fallback.clone(), monitor.clone())
            .with_options(SearchOptions::from(&settings.search));
        if settings.search.rerank {
            searcher = searcher.with_reranker(Arc::new(LexicalReranker::default()));
        }
        let sync = SyncManager::new(primary.clone(), fallback.clone(), monitor, &settings.sync);
        tracing::debug!(model = cache.model_id(), dim, "engine ready");

        Ok(Self { settings, cache, primary, fallback, searcher: Arc::new(searcher), sync })
    }

    pub fn assessor(&self) -> CoverageAssessor { CoverageAssessor::new(self.searcher.clone()) }

    /// Build a query from CLI flags, falling back to configured defaults.
    pub fn query(&self, text: &str, hybrid: bool, top_k: Option<usize>, threshold: f32, filters: Meta) -> Result<SearchQuery> {
        let mut builder = SearchQuery::builder(text)
            .top_k(top_k.unwrap_or(self.settings.search.default_top_k))
            .score_threshold(threshold)
            .filters(filters);
        if hybrid {
            builder = builder.hybrid(self.settings.search.sparse_weight);
        }
        builder.build()
    }
}

/// Opens the Primary store. An unreachable Primary still yields an engine
/// that serves from Fallback until Primary answers health checks.
async fn open_primary(settings: &StoreSettings, dim: usize) -> Result<Arc<dyn VectorStore>> {
    match LanceStore::open("primary", settings, dim).await {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) if e.is_transient() => {
            tracing::warn!(uri = %settings.uri, error = %e, "primary unreachable at startup");
            Ok(Arc::new(Unreachable { reason: e.to_string() }))
        }
        Err(e) => Err(e),
    }
}

struct Unreachable {
    reason: String,
}

impl Unreachable {
    fn fail<T>(&self) -> Result<T> { Err(Error::TransientConnection(self.reason.clone())) }
}

#[async_trait]
impl VectorStore for Unreachable {
    fn name(&self) -> &str { "primary" }
    async fn insert(&self, _items: &[Chunk]) -> Result<()> { self.fail() }
    async fn search(&self, _vector: &[f32], _filters: &Meta, _top_k: usize, _threshold: f32) -> Result<Vec<RawResult>> { self.fail() }
    async fn keyword_search(&self, _text: &str, _filters: &Meta, _top_k: usize) -> Result<Vec<RawResult>> { self.fail() }
    async fn health_check(&self) -> bool { false }
    async fn scan(&self, _offset: usize, _limit: usize) -> Result<Vec<Chunk>> { self.fail() }
    async fn count(&self) -> Result<usize> { self.fail() }
}
