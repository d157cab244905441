use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kbase_cache::{ContentCache, MemoryCacheStore};
use kbase_core::config::{HealthSettings, SyncSettings};
use kbase_core::{
    Chunk, Error, Meta, ModeSource, RawResult, Result, SearchQuery, StoreRole, SyncMode, SyncPhase,
    VectorStore,
};
use kbase_embed::HashEmbedder;
use kbase_hybrid::HybridSearcher;
use kbase_sync::{FailoverMonitor, SyncManager, SyncStateHandle};
use kbase_vector::MemoryStore;

const DIM: usize = 8;

/// Wraps a memory store with injectable scan faults and latency.
struct FlakyPrimary {
    inner: MemoryStore,
    fail_from_offset: Option<usize>,
    page_delay: Duration,
    health_delay: Duration,
    scans: AtomicUsize,
}

impl FlakyPrimary {
    fn new(inner: MemoryStore) -> Self {
        Self { inner, fail_from_offset: None, page_delay: Duration::ZERO, health_delay: Duration::ZERO, scans: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl VectorStore for FlakyPrimary {
    fn name(&self) -> &str { self.inner.name() }
    async fn insert(&self, items: &[Chunk]) -> Result<()> { self.inner.insert(items).await }
    async fn search(&self, vector: &[f32], filters: &Meta, top_k: usize, threshold: f32) -> Result<Vec<RawResult>> {
        self.inner.search(vector, filters, top_k, threshold).await
    }
    async fn keyword_search(&self, text: &str, filters: &Meta, top_k: usize) -> Result<Vec<RawResult>> {
        self.inner.keyword_search(text, filters, top_k).await
    }
    async fn health_check(&self) -> bool {
        tokio::time::sleep(self.health_delay).await;
        self.inner.health_check().await
    }
    async fn scan(&self, offset: usize, limit: usize) -> Result<Vec<Chunk>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.page_delay).await;
        if self.fail_from_offset.is_some_and(|at| offset >= at) {
            return Err(Error::Store(format!("simulated fault at offset {offset}")));
        }
        self.inner.scan(offset, limit).await
    }
    async fn count(&self) -> Result<usize> { self.inner.count().await }
}

fn chunk(id: &str, text: &str) -> Chunk {
    let mut metadata = Meta::new();
    metadata.insert("source".into(), "test".into());
    Chunk { id: id.into(), content: text.into(), metadata, vector: HashEmbedder::new(DIM).embed_text(text) }
}

async fn primary_with(n: usize) -> MemoryStore {
    let store = MemoryStore::new("primary", DIM).unwrap();
    let items: Vec<Chunk> = (0..n).map(|i| chunk(&format!("p{i:02}"), &format!("primary note number {i}"))).collect();
    store.insert(&items).await.unwrap();
    store
}

async fn stale_fallback() -> Arc<MemoryStore> {
    let store = MemoryStore::new("fallback", DIM).unwrap();
    store.insert(&[chunk("old-1", "stale offline note"), chunk("old-2", "another stale note")]).await.unwrap();
    Arc::new(store)
}

fn settings(page_size: usize, deadline_ms: u64) -> SyncSettings { SyncSettings { page_size, deadline_ms } }

fn manager(primary: Arc<dyn VectorStore>, fallback: Arc<MemoryStore>, sync: SyncSettings) -> SyncManager {
    let monitor = Arc::new(FailoverMonitor::new(primary.clone(), SyncStateHandle::new(), &HealthSettings::default()));
    SyncManager::new(primary, fallback, monitor, &sync)
}

#[tokio::test]
async fn sync_replaces_fallback_with_primary() {
    let primary = Arc::new(primary_with(7).await);
    let fallback = stale_fallback().await;
    let m = manager(primary.clone(), fallback.clone(), settings(3, 10_000));

    let result = m.sync().await;
    assert!(result.success, "{:?}", result.reason);
    assert_eq!(result.items_copied, 7);
    assert_eq!(fallback.export().unwrap(), primary.export().unwrap());

    let state = m.state();
    assert_eq!(state.phase, SyncPhase::Idle);
    assert!(!state.in_flight);
    assert_eq!(state.last_sync_at, Some(result.finished_at));
    assert_eq!(state.last_result, Some(result));
}

#[tokio::test]
async fn aborted_sync_leaves_fallback_untouched_at_every_page() {
    for failing_page in 0..3 {
        let primary = Arc::new(FlakyPrimary { fail_from_offset: Some(failing_page * 3), ..FlakyPrimary::new(primary_with(7).await) });
        let fallback = stale_fallback().await;
        let before = fallback.export().unwrap();
        let m = manager(primary, fallback.clone(), settings(3, 10_000));

        let result = m.sync().await;
        assert!(!result.success);
        assert_eq!(result.items_copied, failing_page * 3);
        assert!(result.reason.as_deref().unwrap_or_default().contains("simulated fault"));
        assert_eq!(fallback.export().unwrap(), before, "page {failing_page}");
        assert_eq!(fallback.staged_count(), 0);
        assert_eq!(m.state().phase, SyncPhase::Idle);
        assert_eq!(m.state().last_sync_at, None);
        assert_eq!(m.state().mode, SyncMode::Online);
    }
}

#[tokio::test]
async fn repeated_sync_is_stable() {
    let primary = Arc::new(primary_with(5).await);
    let fallback = stale_fallback().await;
    let m = manager(primary.clone(), fallback.clone(), settings(2, 10_000));

    assert!(m.sync().await.success);
    let first = fallback.export().unwrap();
    assert!(m.sync().await.success);
    assert_eq!(fallback.export().unwrap(), first);
    assert_eq!(first, primary.export().unwrap());
}

#[tokio::test]
async fn concurrent_callers_share_one_sync() {
    let primary = Arc::new(FlakyPrimary { page_delay: Duration::from_millis(20), ..FlakyPrimary::new(primary_with(7).await) });
    let fallback = stale_fallback().await;
    let m = manager(primary.clone(), fallback, settings(3, 10_000));

    let (a, b, c) = tokio::join!(m.sync(), m.sync(), m.sync());
    assert!(a.success);
    assert_eq!(a, b);
    assert_eq!(b, c);
    // 3 + 3 + 1 items: one run, three pages.
    assert_eq!(primary.scans.load(Ordering::SeqCst), 3);

    let again = m.sync().await;
    assert_ne!(again.generation, a.generation);
}

#[tokio::test]
async fn cancel_rolls_back_in_flight_sync() {
    let primary = Arc::new(FlakyPrimary { page_delay: Duration::from_millis(40), ..FlakyPrimary::new(primary_with(20).await) });
    let fallback = stale_fallback().await;
    let before = fallback.export().unwrap();
    let m = manager(primary, fallback.clone(), settings(2, 10_000));

    let running = tokio::spawn({
        let m = m.clone();
        async move { m.sync().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(m.state().in_flight);
    assert!(m.cancel());

    let result = running.await.unwrap();
    assert!(!result.success);
    assert!(result.reason.as_deref().unwrap_or_default().contains("cancelled"));
    assert_eq!(fallback.export().unwrap(), before);
    assert_eq!(fallback.staged_count(), 0);
    assert!(!m.cancel());
}

#[tokio::test]
async fn deadline_rolls_back() {
    let primary = Arc::new(FlakyPrimary { page_delay: Duration::from_millis(50), ..FlakyPrimary::new(primary_with(6).await) });
    let fallback = stale_fallback().await;
    let before = fallback.export().unwrap();
    let m = manager(primary, fallback.clone(), settings(2, 30));

    let result = m.sync().await;
    assert!(!result.success);
    assert!(result.reason.as_deref().unwrap_or_default().contains("deadline"));
    assert_eq!(fallback.export().unwrap(), before);
}

#[tokio::test]
async fn unreachable_primary_fails_sync_and_degrades() {
    let primary = Arc::new(primary_with(3).await);
    primary.set_reachable(false);
    let fallback = stale_fallback().await;
    let before = fallback.export().unwrap();
    let m = manager(primary, fallback.clone(), settings(2, 10_000));

    let result = m.sync().await;
    assert!(!result.success);
    assert_eq!(fallback.export().unwrap(), before);
    assert_eq!(m.state().mode, SyncMode::Degraded);
    assert!(!m.state().primary_reachable);
}

#[tokio::test]
async fn unreachable_fallback_fails_sync_but_stays_online() {
    let primary = Arc::new(primary_with(3).await);
    let fallback = stale_fallback().await;
    fallback.set_reachable(false);
    let m = manager(primary, fallback.clone(), settings(2, 10_000));

    let result = m.sync().await;
    assert!(!result.success);
    assert!(result.reason.as_deref().unwrap_or_default().contains("fallback"));
    let state = m.state();
    assert_eq!(state.mode, SyncMode::Online);
    assert!(state.primary_reachable);
    assert_eq!(state.phase, SyncPhase::Idle);

    fallback.set_reachable(true);
    assert_eq!(fallback.staged_count(), 0);
    assert!(m.sync().await.success);
}

#[tokio::test]
async fn slow_health_check_counts_as_unhealthy() {
    let primary = Arc::new(FlakyPrimary { health_delay: Duration::from_millis(200), ..FlakyPrimary::new(primary_with(1).await) });
    let monitor = FailoverMonitor::new(primary, SyncStateHandle::new(), &HealthSettings { timeout_ms: 20, ttl_ms: 0 });
    assert!(!monitor.check().await);
    assert_eq!(monitor.resolve_mode().await, SyncMode::Degraded);
}

#[tokio::test]
async fn health_results_are_cached_for_the_ttl() {
    let primary = Arc::new(primary_with(1).await);
    let monitor = FailoverMonitor::new(primary.clone(), SyncStateHandle::new(), &HealthSettings { timeout_ms: 1_000, ttl_ms: 60_000 });
    assert_eq!(monitor.resolve_mode().await, SyncMode::Online);

    primary.set_reachable(false);
    assert_eq!(monitor.resolve_mode().await, SyncMode::Online);

    monitor.report_primary_failure("connection refused");
    assert_eq!(monitor.resolve_mode().await, SyncMode::Degraded);

    primary.set_reachable(true);
    assert!(monitor.check().await);
    assert_eq!(monitor.resolve_mode().await, SyncMode::Online);
}

#[tokio::test]
async fn searches_follow_primary_health() -> anyhow::Result<()> {
    let embedder = Arc::new(HashEmbedder::new(DIM));
    let primary = Arc::new(primary_with(4).await);
    let fallback = stale_fallback().await;
    let state = SyncStateHandle::new();
    let monitor = Arc::new(FailoverMonitor::new(primary.clone(), state.clone(), &HealthSettings { timeout_ms: 500, ttl_ms: 0 }));
    let m = SyncManager::new(primary.clone(), fallback.clone(), monitor.clone(), &settings(3, 10_000));
    assert!(m.sync().await.success);

    let cache = ContentCache::new(embedder, Arc::new(MemoryCacheStore::new()));
    let searcher = HybridSearcher::new(cache, primary.clone(), fallback, monitor);
    let query = SearchQuery::semantic("primary note", 2)?;

    let online = searcher.search(&query).await?;
    assert_eq!(online[0].served_by(), Some(StoreRole::Primary));
    assert!(!online[0].is_degraded());

    primary.set_reachable(false);
    let offline = searcher.search(&query).await?;
    assert!(!offline.is_empty());
    assert_eq!(offline[0].served_by(), Some(StoreRole::Fallback));
    assert!(offline[0].is_degraded());
    assert_eq!(m.current_mode().await, SyncMode::Degraded);

    primary.set_reachable(true);
    let back = searcher.search(&query).await?;
    assert_eq!(back[0].served_by(), Some(StoreRole::Primary));
    assert!(!back[0].is_degraded());
    assert_eq!(state.mode(), SyncMode::Online);
    Ok(())
}
