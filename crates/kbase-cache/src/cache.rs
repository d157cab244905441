use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kbase_core::config::{EmbeddingSettings, RetryPolicy};
use kbase_core::{EmbedError, EmbeddingProvider, Error, Result};

use crate::key::{normalize, CacheKey};
use crate::store::CacheStore;

type Pending = Shared<BoxFuture<'static, Result<Arc<Vec<f32>>>>>;

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub upstream_calls: u64,
    /// Callers that joined another caller's in-flight miss.
    pub coalesced: u64,
    pub corrupt_entries: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    upstream_calls: AtomicU64,
    coalesced: AtomicU64,
    corrupt_entries: AtomicU64,
}

struct Inner {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn CacheStore>,
    policy: RetryPolicy,
    max_batch_size: usize,
    max_bytes: u64,
    in_flight: Mutex<HashMap<CacheKey, Pending>>,
    counters: Counters,
}

/// Embedding cache in front of one [`EmbeddingProvider`].
///
/// Cheap to clone; clones share entries, in-flight work and counters.
#[derive(Clone)]
pub struct ContentCache { inner: Arc<Inner> }

impl ContentCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, store: Arc<dyn CacheStore>) -> Self {
        Self::with_settings(provider, store, &EmbeddingSettings::default(), 0)
    }

    /// `max_bytes = 0` disables eviction.
    pub fn with_settings(provider: Arc<dyn EmbeddingProvider>, store: Arc<dyn CacheStore>, settings: &EmbeddingSettings, max_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                store,
                policy: settings.retry_policy(),
                max_batch_size: settings.max_batch_size.max(1),
                max_bytes,
                in_flight: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn model_id(&self) -> &str { self.inner.provider.model_id() }

    pub fn dim(&self) -> usize { self.inner.provider.dim() }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            upstream_calls: c.upstream_calls.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            corrupt_entries: c.corrupt_entries.load(Ordering::Relaxed),
        }
    }

    /// Vector for `text`, from the store when present, else from the provider.
    pub async fn get_or_compute(&self, text: &str) -> Result<Vec<f32>> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Err(Error::InvalidArgument("cannot embed blank text".into()));
        }
        let key = CacheKey::for_normalized(self.model_id(), &normalized);
        if let Some(v) = self.inner.lookup(&key).await {
            return Ok(v);
        }

        let pending = {
            let mut in_flight = self.inner.in_flight.lock().map_err(|_| Error::Store("in-flight table poisoned".into()))?;
            match in_flight.get(&key) {
                Some(p) => {
                    self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    p.clone()
                }
                None => {
                    let fut = Arc::clone(&self.inner).compute_one(key.clone(), normalized).boxed().shared();
                    in_flight.insert(key, fut.clone());
                    fut
                }
            }
        };
        pending.await.map(|v| v.as_ref().clone())
    }

    /// Vectors for `texts`, in input order.
    ///
    /// Duplicate texts are embedded once; misses go upstream in batches of at
    /// most `max_batch_size`.
    pub async fn get_or_compute_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut keys = Vec::with_capacity(texts.len());
        let mut unique: HashMap<CacheKey, Option<Vec<f32>>> = HashMap::new();
        let mut misses: Vec<(CacheKey, String)> = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let normalized = normalize(text);
            if normalized.is_empty() {
                return Err(Error::InvalidArgument(format!("text #{i} is blank")));
            }
            let key = CacheKey::for_normalized(self.model_id(), &normalized);
            if !unique.contains_key(&key) {
                let hit = self.inner.lookup(&key).await;
                if hit.is_none() { misses.push((key.clone(), normalized)); }
                unique.insert(key.clone(), hit);
            }
            keys.push(key);
        }

        for batch in misses.chunks(self.inner.max_batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self.inner.embed_with_retry(&inputs).await?;
            for ((key, _), vector) in batch.iter().zip(vectors) {
                self.inner.persist(key, &vector).await;
                unique.insert(key.clone(), Some(vector));
            }
        }

        keys.iter()
            .map(|k| unique.get(k).cloned().flatten().ok_or_else(|| Error::Store("batch lost a computed vector".into())))
            .collect()
    }
}

impl Inner {
    /// Store hit, or `None` for a miss. Unreadable and mis-sized entries count as misses.
    async fn lookup(&self, key: &CacheKey) -> Option<Vec<f32>> {
        match self.store.load(key).await {
            Ok(Some(v)) if v.len() == self.provider.dim() => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            Ok(Some(v)) => {
                self.counters.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key.digest_hex(), got = v.len(), want = self.provider.dim(), "cached vector has wrong dimension; recomputing");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.counters.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key.digest_hex(), error = %e, "unreadable cache entry; recomputing");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn compute_one(self: Arc<Self>, key: CacheKey, normalized: String) -> Result<Arc<Vec<f32>>> {
        let outcome = self.embed_with_retry(std::slice::from_ref(&normalized)).await;
        let outcome = match outcome {
            Ok(mut vectors) => match vectors.pop() {
                Some(v) => {
                    self.persist(&key, &v).await;
                    Ok(Arc::new(v))
                }
                None => Err(Error::ProviderUnavailable { attempts: 1, reason: "provider returned no vector".into() }),
            },
            Err(e) => Err(e),
        };
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&key);
        }
        outcome
    }

    /// Write-through; a failed write is logged and the vector is still returned.
    async fn persist(&self, key: &CacheKey, vector: &[f32]) {
        if let Err(e) = self.store.store(key, vector).await {
            tracing::warn!(key = %key.digest_hex(), error = %e, "failed to persist embedding");
            return;
        }
        if self.max_bytes == 0 { return; }
        match self.store.footprint().await {
            Ok(bytes) if bytes > self.max_bytes => match self.store.evict_to(self.max_bytes).await {
                Ok(n) => tracing::debug!(evicted = n, max_bytes = self.max_bytes, "cache evicted oldest entries"),
                Err(e) => tracing::warn!(error = %e, "cache eviction failed"),
            },
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cache footprint unavailable"),
        }
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let dim = self.provider.dim();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.counters.upstream_calls.fetch_add(1, Ordering::Relaxed);
            let err = match tokio::time::timeout(self.policy.request_timeout, self.provider.embed_batch(texts)).await {
                Ok(Ok(vectors)) => {
                    if vectors.len() != texts.len() || vectors.iter().any(|v| v.len() != dim) {
                        return Err(Error::ProviderUnavailable {
                            attempts: attempt,
                            reason: format!("provider returned {} vectors for {} inputs (dim {dim})", vectors.len(), texts.len()),
                        });
                    }
                    return Ok(vectors);
                }
                Ok(Err(EmbedError::InvalidInput(msg))) => return Err(Error::InvalidArgument(msg)),
                Ok(Err(e)) => e,
                Err(_) => EmbedError::Unavailable(format!("request timed out after {}ms", self.policy.request_timeout.as_millis())),
            };
            if attempt >= self.policy.max_attempts {
                tracing::error!(attempts = attempt, error = %err, "embedding provider exhausted retries");
                return Err(Error::ProviderUnavailable { attempts: attempt, reason: err.to_string() });
            }
            let mut delay = self.policy.backoff(attempt);
            if let EmbedError::RateLimited { retry_after: Some(after) } = &err {
                delay = delay.max(*after);
            }
            let delay = jittered(delay);
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "embedding call failed; backing off");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Add up to 50% random jitter.
fn jittered(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    if ms < 2 { return delay; }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=ms / 2))
}
