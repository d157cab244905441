use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use kbase_core::{Error, Result};

use crate::key::CacheKey;

/// Backing storage for cached vectors.
///
/// `load` returns `Err` for an entry that exists but cannot be read back;
/// the cache treats that as a miss and overwrites it.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<f32>>>;
    async fn store(&self, key: &CacheKey, vector: &[f32]) -> Result<()>;
    /// Approximate bytes held.
    async fn footprint(&self) -> Result<u64>;
    /// Evict oldest-inserted entries until the footprint is at most `max_bytes`. Returns entries removed.
    async fn evict_to(&self, max_bytes: u64) -> Result<usize>;
}

/// Bytes accounted per entry: the vector plus the key.
pub fn entry_bytes(key: &CacheKey, dim: usize) -> u64 { (dim * 4 + 32 + key.model_id().len()) as u64 }

#[derive(Default)]
struct Entries {
    vectors: HashMap<CacheKey, Vec<f32>>,
    order: VecDeque<CacheKey>,
    bytes: u64,
}

/// In-process FIFO cache store.
#[derive(Default)]
pub struct MemoryCacheStore { entries: Mutex<Entries> }

impl MemoryCacheStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.entries.lock().map(|e| e.vectors.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Entries>> {
        self.entries.lock().map_err(|_| Error::Store("cache store lock poisoned".into()))
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> { Ok(self.lock()?.vectors.get(key).cloned()) }

    async fn store(&self, key: &CacheKey, vector: &[f32]) -> Result<()> {
        let mut entries = self.lock()?;
        let added = entry_bytes(key, vector.len());
        match entries.vectors.insert(key.clone(), vector.to_vec()) {
            Some(old) => entries.bytes = entries.bytes - entry_bytes(key, old.len()) + added,
            None => {
                entries.order.push_back(key.clone());
                entries.bytes += added;
            }
        }
        Ok(())
    }

    async fn footprint(&self) -> Result<u64> { Ok(self.lock()?.bytes) }

    async fn evict_to(&self, max_bytes: u64) -> Result<usize> {
        let mut entries = self.lock()?;
        let mut removed = 0;
        while entries.bytes > max_bytes {
            let Some(key) = entries.order.pop_front() else { break };
            if let Some(v) = entries.vectors.remove(&key) {
                entries.bytes -= entry_bytes(&key, v.len());
                removed += 1;
            }
        }
        Ok(removed)
    }
}
