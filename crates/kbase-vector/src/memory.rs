//! In-process generational store.
//!
//! Brute-force cosine search over a `BTreeMap`, with an in-RAM keyword
//! index per generation. Reads see one generation `Arc`; `promote` swaps it.
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use kbase_core::{Chunk, ChunkId, Error, GenerationId, GenerationalStore, Meta, RawResult, Result, VectorStore};
use kbase_text::KeywordIndex;

use crate::filters::{cosine_similarity, matches};

struct Generation {
    id: GenerationId,
    chunks: RwLock<BTreeMap<ChunkId, Chunk>>,
    keyword: KeywordIndex,
}

impl Generation {
    fn new(id: GenerationId) -> Result<Self> {
        Ok(Self { id, chunks: RwLock::new(BTreeMap::new()), keyword: KeywordIndex::in_ram().map_err(|e| Error::store(format!("{e:#}")))? })
    }

    fn upsert(&self, items: &[Chunk]) -> Result<()> {
        {
            let mut chunks = self.chunks.write().map_err(|_| poisoned())?;
            for c in items { chunks.insert(c.id.clone(), c.clone()); }
        }
        self.keyword.upsert(items).map_err(|e| Error::store(format!("{e:#}")))
    }
}

fn poisoned() -> Error { Error::Store("memory store lock poisoned".into()) }

pub struct MemoryStore {
    name: String,
    dim: usize,
    live: RwLock<Arc<Generation>>,
    staged: Mutex<HashMap<GenerationId, Arc<Generation>>>,
    reachable: AtomicBool,
    next_generation: AtomicU64,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>, dim: usize) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            dim,
            live: RwLock::new(Arc::new(Generation::new(GenerationId("g0".into()))?)),
            staged: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Simulate losing or regaining the connection. While unreachable every
    /// call fails with a transient error and `health_check` is false.
    pub fn set_reachable(&self, reachable: bool) { self.reachable.store(reachable, Ordering::SeqCst); }

    /// Live content ordered by id.
    pub fn export(&self) -> Result<Vec<Chunk>> {
        let live = self.snapshot()?;
        let chunks = live.chunks.read().map_err(|_| poisoned())?;
        let out = chunks.values().cloned().collect();
        Ok(out)
    }

    pub fn staged_count(&self) -> usize { self.staged.lock().map(|s| s.len()).unwrap_or(0) }

    fn snapshot(&self) -> Result<Arc<Generation>> { Ok(Arc::clone(&*self.live.read().map_err(|_| poisoned())?)) }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) { Ok(()) } else { Err(Error::TransientConnection(format!("{} is unreachable", self.name))) }
    }

    fn check_dims(&self, items: &[Chunk]) -> Result<()> {
        match items.iter().find(|c| c.vector.len() != self.dim) {
            Some(bad) => Err(Error::InvalidArgument(format!("chunk {} has {} dims, store expects {}", bad.id, bad.vector.len(), self.dim))),
            None => Ok(()),
        }
    }

    fn staged(&self, generation: &GenerationId) -> Result<Arc<Generation>> {
        self.staged
            .lock()
            .map_err(|_| poisoned())?
            .get(generation)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown staging generation {generation}")))
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    fn name(&self) -> &str { &self.name }

    async fn insert(&self, items: &[Chunk]) -> Result<()> {
        self.ensure_reachable()?;
        self.check_dims(items)?;
        self.snapshot()?.upsert(items)
    }

    async fn search(&self, vector: &[f32], filters: &Meta, top_k: usize, score_threshold: f32) -> Result<Vec<RawResult>> {
        self.ensure_reachable()?;
        if vector.len() != self.dim {
            return Err(Error::InvalidArgument(format!("query has {} dims, store expects {}", vector.len(), self.dim)));
        }
        let live = self.snapshot()?;
        let chunks = live.chunks.read().map_err(|_| poisoned())?;
        let mut hits: Vec<RawResult> = chunks
            .values()
            .filter(|c| matches(&c.metadata, filters))
            .map(|c| (c, cosine_similarity(vector, &c.vector)))
            .filter(|(_, s)| *s >= score_threshold)
            .map(|(c, similarity)| RawResult { id: c.id.clone(), content: c.content.clone(), metadata: c.metadata.clone(), similarity })
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn keyword_search(&self, text: &str, filters: &Meta, top_k: usize) -> Result<Vec<RawResult>> {
        self.ensure_reachable()?;
        self.snapshot()?.keyword.search(text, filters, top_k).map_err(|e| Error::store(format!("{e:#}")))
    }

    async fn health_check(&self) -> bool { self.reachable.load(Ordering::SeqCst) }

    async fn scan(&self, offset: usize, limit: usize) -> Result<Vec<Chunk>> {
        self.ensure_reachable()?;
        let live = self.snapshot()?;
        let chunks = live.chunks.read().map_err(|_| poisoned())?;
        let page = chunks.values().skip(offset).take(limit).cloned().collect();
        Ok(page)
    }

    async fn count(&self) -> Result<usize> {
        self.ensure_reachable()?;
        let live = self.snapshot()?;
        let n = live.chunks.read().map_err(|_| poisoned())?.len();
        Ok(n)
    }
}

#[async_trait]
impl GenerationalStore for MemoryStore {
    async fn create_staging(&self) -> Result<GenerationId> {
        self.ensure_reachable()?;
        let id = GenerationId(format!("g{}", self.next_generation.fetch_add(1, Ordering::SeqCst)));
        let generation = Arc::new(Generation::new(id.clone())?);
        self.staged.lock().map_err(|_| poisoned())?.insert(id.clone(), generation);
        Ok(id)
    }

    async fn write_staging(&self, generation: &GenerationId, items: &[Chunk]) -> Result<()> {
        self.ensure_reachable()?;
        self.check_dims(items)?;
        self.staged(generation)?.upsert(items)
    }

    async fn promote(&self, generation: &GenerationId) -> Result<()> {
        self.ensure_reachable()?;
        let next = self
            .staged
            .lock()
            .map_err(|_| poisoned())?
            .remove(generation)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown staging generation {generation}")))?;
        let previous = std::mem::replace(&mut *self.live.write().map_err(|_| poisoned())?, next);
        tracing::debug!(store = %self.name, generation = %generation, previous = %previous.id, "promoted generation");
        Ok(())
    }

    async fn discard(&self, generation: &GenerationId) -> Result<()> {
        self.staged.lock().map_err(|_| poisoned())?.remove(generation);
        Ok(())
    }

    async fn live_generation(&self) -> Result<Option<GenerationId>> { Ok(Some(self.snapshot()?.id.clone())) }
}
