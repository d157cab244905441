use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kbase_cache::{CacheKey, CacheStore, ContentCache, MemoryCacheStore};
use kbase_core::config::EmbeddingSettings;
use kbase_core::{EmbedError, EmbeddingProvider, Error, Result};

struct ScriptedProvider {
    id: String,
    dim: usize,
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    failures: Mutex<VecDeque<EmbedError>>,
    delay: Duration,
}

impl ScriptedProvider {
    fn new(id: &str) -> Self {
        Self {
            id: id.into(),
            dim: 8,
            calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
        }
    }

    fn failing_with(self, failures: Vec<EmbedError>) -> Self {
        *self.failures.lock().unwrap() = failures.into();
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    fn model_id(&self) -> &str { &self.id }
    fn dim(&self) -> usize { self.dim }

    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(texts.len());
        if !self.delay.is_zero() { tokio::time::sleep(self.delay).await; }
        if let Some(err) = self.failures.lock().unwrap().pop_front() { return Err(err); }
        Ok(texts
            .iter()
            .map(|t| (0..self.dim).map(|i| t.bytes().map(|b| b as f32).sum::<f32>() + i as f32).collect())
            .collect())
    }
}

fn fast_retry(max_attempts: u32) -> EmbeddingSettings {
    EmbeddingSettings { max_attempts, base_backoff_ms: 1, max_backoff_ms: 4, ..EmbeddingSettings::default() }
}

#[tokio::test]
async fn second_lookup_is_a_hit_with_identical_vector() {
    let provider = Arc::new(ScriptedProvider::new("m1"));
    let cache = ContentCache::new(provider.clone(), Arc::new(MemoryCacheStore::new()));

    let first = cache.get_or_compute("Greywater  reuse").await.unwrap();
    let second = cache.get_or_compute("greywater reuse ").await.unwrap();

    assert_eq!(provider.calls(), 1);
    assert_eq!(first, second);
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.upstream_calls), (1, 1, 1));
}

#[tokio::test]
async fn new_model_id_never_reuses_entries() {
    let store: Arc<MemoryCacheStore> = Arc::new(MemoryCacheStore::new());
    let old = Arc::new(ScriptedProvider::new("model-a"));
    let new = Arc::new(ScriptedProvider::new("model-b"));

    ContentCache::new(old.clone(), store.clone()).get_or_compute("compost ratios").await.unwrap();
    let upgraded = ContentCache::new(new.clone(), store.clone());
    upgraded.get_or_compute("compost ratios").await.unwrap();

    assert_eq!(new.calls(), 1);
    assert_eq!(upgraded.stats().hits, 0);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn concurrent_misses_share_one_upstream_call() {
    let provider = Arc::new(ScriptedProvider::new("m").slow(Duration::from_millis(50)));
    let cache = ContentCache::new(provider.clone(), Arc::new(MemoryCacheStore::new()));

    let calls = (0..16).map(|_| cache.get_or_compute("root cellar humidity"));
    let results: Vec<_> = futures::future::join_all(calls).await;

    assert_eq!(provider.calls(), 1);
    let first = results[0].as_ref().unwrap();
    assert!(results.iter().all(|r| r.as_ref().unwrap() == first));
    assert_eq!(cache.stats().coalesced, 15);
}

/// Fails the first `load` as if the entry were unreadable.
struct CorruptOnce { inner: MemoryCacheStore, tripped: AtomicUsize }

#[async_trait]
impl CacheStore for CorruptOnce {
    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> {
        if self.tripped.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::Store("truncated vector".into()));
        }
        self.inner.load(key).await
    }
    async fn store(&self, key: &CacheKey, vector: &[f32]) -> Result<()> { self.inner.store(key, vector).await }
    async fn footprint(&self) -> Result<u64> { self.inner.footprint().await }
    async fn evict_to(&self, max_bytes: u64) -> Result<usize> { self.inner.evict_to(max_bytes).await }
}

#[tokio::test]
async fn unreadable_entry_is_recomputed_not_surfaced() {
    let provider = Arc::new(ScriptedProvider::new("m"));
    let store = Arc::new(CorruptOnce { inner: MemoryCacheStore::new(), tripped: AtomicUsize::new(0) });
    let cache = ContentCache::new(provider.clone(), store);

    assert!(cache.get_or_compute("seed saving").await.is_ok());
    assert!(cache.get_or_compute("seed saving").await.is_ok());
    assert_eq!(provider.calls(), 1);
    assert_eq!(cache.stats().corrupt_entries, 1);
}

#[tokio::test]
async fn rate_limits_are_retried_until_success() {
    let provider = Arc::new(ScriptedProvider::new("m").failing_with(vec![
        EmbedError::RateLimited { retry_after: None },
        EmbedError::Unavailable("503".into()),
    ]));
    let cache = ContentCache::with_settings(provider.clone(), Arc::new(MemoryCacheStore::new()), &fast_retry(5), 0);

    assert!(cache.get_or_compute("well pump sizing").await.is_ok());
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_provider_unavailable() {
    let failures = (0..10).map(|_| EmbedError::RateLimited { retry_after: None }).collect();
    let provider = Arc::new(ScriptedProvider::new("m").failing_with(failures));
    let cache = ContentCache::with_settings(provider.clone(), Arc::new(MemoryCacheStore::new()), &fast_retry(3), 0);

    let err = cache.get_or_compute("battery bank").await.unwrap_err();
    assert!(matches!(err, Error::ProviderUnavailable { attempts: 3, .. }), "{err}");
    assert_eq!(provider.calls(), 3);

    // A failed miss is not cached as in-flight; the next call goes upstream again.
    let _ = cache.get_or_compute("battery bank").await;
    assert_eq!(provider.calls(), 6);
}

#[tokio::test]
async fn invalid_input_is_not_retried() {
    let provider = Arc::new(ScriptedProvider::new("m").failing_with(vec![EmbedError::InvalidInput("too long".into())]));
    let cache = ContentCache::with_settings(provider.clone(), Arc::new(MemoryCacheStore::new()), &fast_retry(5), 0);

    assert!(matches!(cache.get_or_compute("x").await, Err(Error::InvalidArgument(_))));
    assert_eq!(provider.calls(), 1);
    assert!(matches!(cache.get_or_compute("   ").await, Err(Error::InvalidArgument(_))));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn batch_dedupes_and_respects_max_batch_size() {
    let provider = Arc::new(ScriptedProvider::new("m"));
    let settings = EmbeddingSettings { max_batch_size: 2, ..EmbeddingSettings::default() };
    let cache = ContentCache::with_settings(provider.clone(), Arc::new(MemoryCacheStore::new()), &settings, 0);
    cache.get_or_compute("cached already").await.unwrap();

    let texts: Vec<String> = ["alpha", "ALPHA ", "beta", "gamma", "cached already", "delta"].iter().map(|s| s.to_string()).collect();
    let out = cache.get_or_compute_batch(&texts).await.unwrap();

    assert_eq!(out.len(), 6);
    assert_eq!(out[0], out[1]);
    assert_eq!(out[4], cache.get_or_compute("cached already").await.unwrap());
    assert_eq!(*provider.batch_sizes.lock().unwrap(), vec![1, 2, 2]);
}

#[tokio::test]
async fn footprint_stays_under_the_limit() {
    let provider = Arc::new(ScriptedProvider::new("m"));
    let store = Arc::new(MemoryCacheStore::new());
    let limit = 3 * (8 * 4 + 32 + 1);
    let cache = ContentCache::with_settings(provider.clone(), store.clone(), &EmbeddingSettings::default(), limit);

    for i in 0..10 {
        cache.get_or_compute(&format!("note {i}")).await.unwrap();
    }
    assert!(store.footprint().await.unwrap() <= limit);
    assert_eq!(store.len(), 3);
}
