//! Generational LanceDB store.
//!
//! Each generation is its own table `{collection}__{generation}` with a
//! tantivy keyword index beside it. The live generation is a pointer in the
//! meta table; promoting a staged generation is a single pointer write.
//!
//! A generation replaced by `promote` is retired, not dropped: searches that
//! resolved it just before the swap can still finish against it. Retired
//! tables are dropped when the next staging generation is created, and any
//! non-live table of the collection is swept when the store is opened.
use arrow_array::RecordBatchIterator;
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use kbase_core::config::StoreSettings;
use kbase_core::{Chunk, Error, GenerationId, GenerationalStore, Meta, RawResult, Result, VectorStore};
use kbase_text::KeywordIndex;

use crate::filters::matches;
use crate::schema::{batch_to_chunks, chunk_schema, chunks_to_batch};
use crate::table::{drop_table_if_exists, ensure_table, get_meta, open_db, set_meta, table_exists};

/// Map a backend failure onto the shared taxonomy.
pub(crate) fn lance_err(err: impl Into<anyhow::Error>) -> Error {
    let err = err.into();
    let msg = format!("{err:#}");
    let lower = msg.to_lowercase();
    if ["timed out", "timeout", "connection refused", "connection reset", "broken pipe", "dns error"].iter().any(|p| lower.contains(p)) {
        Error::TransientConnection(msg)
    } else {
        Error::Store(msg)
    }
}

pub struct LanceStore {
    name: String,
    conn: Connection,
    collection: String,
    dim: usize,
    /// Local root for keyword indexes; `None` keeps them in memory.
    keyword_root: Option<PathBuf>,
    live: Mutex<Option<GenerationId>>,
    retired: Mutex<Vec<GenerationId>>,
    keyword: Mutex<HashMap<GenerationId, Arc<KeywordIndex>>>,
}

impl LanceStore {
    pub async fn open(name: &str, settings: &StoreSettings, dim: usize) -> Result<Self> {
        if settings.collection.is_empty() || settings.collection.contains("__") {
            return Err(Error::Configuration(format!("invalid collection name {:?}", settings.collection)));
        }
        let conn = open_db(settings).await.map_err(|e| Error::Configuration(format!("cannot open {}: {e:#}", settings.uri)))?;
        let keyword_root = (!settings.uri.contains("://")).then(|| PathBuf::from(&settings.uri).join("_keyword"));
        let store = Self {
            name: name.to_string(),
            conn,
            collection: settings.collection.clone(),
            dim,
            keyword_root,
            live: Mutex::new(None),
            retired: Mutex::new(Vec::new()),
            keyword: Mutex::new(HashMap::new()),
        };
        let live = get_meta(&store.conn, &store.pointer_key()).await.map_err(lance_err)?.map(GenerationId);
        tracing::info!(store = %store.name, uri = %settings.uri, live = ?live, "opened lance store");
        store.sweep_orphans(live.as_ref()).await?;
        *store.live.lock().map_err(|_| poisoned())? = live;
        Ok(store)
    }

    /// Drop every generation table of this collection except `live`: retired
    /// generations and staging left behind by an earlier process.
    async fn sweep_orphans(&self, live: Option<&GenerationId>) -> Result<()> {
        let prefix = format!("{}__", self.collection);
        let names = self.conn.table_names().execute().await.map_err(lance_err)?;
        for name in names {
            let Some(id) = name.strip_prefix(&prefix) else { continue };
            let generation = GenerationId(id.to_string());
            if Some(&generation) == live { continue; }
            tracing::info!(store = %self.name, generation = %generation, "dropping orphaned generation");
            drop_table_if_exists(&self.conn, &name).await.map_err(lance_err)?;
            self.forget_keyword(&generation);
        }
        Ok(())
    }

    /// Drop generations retired by earlier promotes.
    async fn reap_retired(&self) -> Result<()> {
        let retired = std::mem::take(&mut *self.retired.lock().map_err(|_| poisoned())?);
        for old in retired {
            if let Err(e) = drop_table_if_exists(&self.conn, &self.table_name(&old)).await {
                tracing::warn!(store = %self.name, generation = %old, error = %e, "failed to drop retired generation");
                continue;
            }
            self.forget_keyword(&old);
            tracing::debug!(store = %self.name, generation = %old, "dropped retired generation");
        }
        Ok(())
    }

    pub fn dim(&self) -> usize { self.dim }

    fn pointer_key(&self) -> String { format!("live_generation:{}", self.collection) }

    fn table_name(&self, generation: &GenerationId) -> String { format!("{}__{}", self.collection, generation.0) }

    fn cached_live(&self) -> Result<Option<GenerationId>> { Ok(self.live.lock().map_err(|_| poisoned())?.clone()) }

    /// Live generation, creating and promoting an empty one on first write.
    async fn live_or_init(&self) -> Result<GenerationId> {
        if let Some(g) = self.cached_live()? { return Ok(g); }
        let generation = self.create_staging().await?;
        self.promote(&generation).await?;
        Ok(generation)
    }

    async fn open_generation(&self, generation: &GenerationId) -> Result<lancedb::Table> {
        self.conn.open_table(self.table_name(generation)).execute().await.map_err(lance_err)
    }

    /// Keyword index for a generation, rebuilt from the table if it is missing or behind.
    async fn keyword_index(&self, generation: &GenerationId) -> Result<Arc<KeywordIndex>> {
        if let Some(idx) = self.keyword.lock().map_err(|_| poisoned())?.get(generation).cloned() {
            return Ok(idx);
        }
        let index = match &self.keyword_root {
            Some(root) => KeywordIndex::open_or_create(&root.join(self.table_name(generation))),
            None => KeywordIndex::in_ram(),
        }
        .map_err(lance_err)?;
        let index = Arc::new(index);
        let rows = self.open_generation(generation).await?.count_rows(None).await.map_err(lance_err)?;
        if index.len() as usize != rows {
            tracing::info!(store = %self.name, generation = %generation, rows, "rebuilding keyword index");
            let chunks = self.scan_generation(generation, 0, usize::MAX).await?;
            let idx = Arc::clone(&index);
            tokio::task::spawn_blocking(move || idx.upsert(&chunks)).await.map_err(lance_err)?.map_err(lance_err)?;
        }
        let mut map = self.keyword.lock().map_err(|_| poisoned())?;
        Ok(Arc::clone(map.entry(generation.clone()).or_insert(index)))
    }

    async fn upsert_into(&self, generation: &GenerationId, items: &[Chunk]) -> Result<()> {
        if items.is_empty() { return Ok(()); }
        if let Some(bad) = items.iter().find(|c| c.vector.len() != self.dim) {
            return Err(Error::InvalidArgument(format!("chunk {} has {} dims, store expects {}", bad.id, bad.vector.len(), self.dim)));
        }
        let table = self.open_generation(generation).await?;
        let batch = chunks_to_batch(items, self.dim).map_err(lance_err)?;
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), chunk_schema(self.dim)));
        let mut mi = table.merge_insert(&["id"]);
        mi.when_matched_update_all(None).when_not_matched_insert_all();
        mi.execute(reader).await.map_err(lance_err)?;
        let index = self.keyword_index(generation).await?;
        let items = items.to_vec();
        let indexed = tokio::task::spawn_blocking(move || index.upsert(&items)).await.map_err(lance_err).and_then(|r| r.map_err(lance_err));
        if let Err(e) = &indexed {
            // The rows are in the table; drop the index so the next access rebuilds it from there.
            tracing::warn!(store = %self.name, generation = %generation, error = %e, "keyword index update failed; scheduling rebuild");
            self.forget_keyword(generation);
        }
        indexed
    }

    async fn scan_generation(&self, generation: &GenerationId, offset: usize, limit: usize) -> Result<Vec<Chunk>> {
        let table = self.open_generation(generation).await?;
        let mut query = table.query().offset(offset);
        if limit != usize::MAX { query = query.limit(limit); }
        let mut stream = query.execute().await.map_err(lance_err)?;
        let mut out = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(lance_err)? {
            out.extend(batch_to_chunks(&batch, self.dim).map_err(lance_err)?.into_iter().map(|(c, _)| c));
        }
        Ok(out)
    }

    fn forget_keyword(&self, generation: &GenerationId) {
        if let Ok(mut map) = self.keyword.lock() { map.remove(generation); }
        if let Some(root) = &self.keyword_root {
            let dir = root.join(self.table_name(generation));
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) { tracing::warn!(dir = %dir.display(), error = %e, "failed to remove keyword index"); }
            }
        }
    }
}

fn poisoned() -> Error { Error::Store("lance store state lock poisoned".into()) }

#[async_trait]
impl VectorStore for LanceStore {
    fn name(&self) -> &str { &self.name }

    async fn insert(&self, items: &[Chunk]) -> Result<()> {
        let generation = self.live_or_init().await?;
        self.upsert_into(&generation, items).await
    }

    async fn search(&self, vector: &[f32], filters: &Meta, top_k: usize, score_threshold: f32) -> Result<Vec<RawResult>> {
        if vector.len() != self.dim {
            return Err(Error::InvalidArgument(format!("query has {} dims, store expects {}", vector.len(), self.dim)));
        }
        let Some(generation) = self.cached_live()? else { return Ok(Vec::new()) };
        if top_k == 0 { return Ok(Vec::new()); }
        let table = self.open_generation(&generation).await?;
        // Metadata lives in a JSON column, so filters apply after the ANN pass; widen until satisfied.
        let mut fetch = if filters.is_empty() { top_k } else { top_k * 4 };
        loop {
            let mut stream = table
                .vector_search(vector.to_vec())
                .map_err(lance_err)?
                .distance_type(DistanceType::Cosine)
                .limit(fetch)
                .execute()
                .await
                .map_err(lance_err)?;
            let mut fetched = 0usize;
            let mut out = Vec::new();
            while let Some(batch) = stream.try_next().await.map_err(lance_err)? {
                for (chunk, distance) in batch_to_chunks(&batch, self.dim).map_err(lance_err)? {
                    fetched += 1;
                    let similarity = (1.0 - distance.unwrap_or(1.0)).clamp(0.0, 1.0);
                    if similarity < score_threshold || !matches(&chunk.metadata, filters) { continue; }
                    out.push(RawResult { id: chunk.id, content: chunk.content, metadata: chunk.metadata, similarity });
                }
            }
            if out.len() >= top_k || fetched < fetch {
                out.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then_with(|| a.id.cmp(&b.id)));
                out.truncate(top_k);
                return Ok(out);
            }
            fetch *= 2;
        }
    }

    async fn keyword_search(&self, text: &str, filters: &Meta, top_k: usize) -> Result<Vec<RawResult>> {
        let Some(generation) = self.cached_live()? else { return Ok(Vec::new()) };
        let index = self.keyword_index(&generation).await?;
        let (text, filters) = (text.to_string(), filters.clone());
        tokio::task::spawn_blocking(move || index.search(&text, &filters, top_k)).await.map_err(lance_err)?.map_err(lance_err)
    }

    async fn health_check(&self) -> bool {
        match self.conn.table_names().execute().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(store = %self.name, error = %e, "health check failed");
                false
            }
        }
    }

    async fn scan(&self, offset: usize, limit: usize) -> Result<Vec<Chunk>> {
        match self.cached_live()? {
            Some(generation) => self.scan_generation(&generation, offset, limit).await,
            None => Ok(Vec::new()),
        }
    }

    async fn count(&self) -> Result<usize> {
        match self.cached_live()? {
            Some(generation) => self.open_generation(&generation).await?.count_rows(None).await.map_err(lance_err),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl GenerationalStore for LanceStore {
    async fn create_staging(&self) -> Result<GenerationId> {
        self.reap_retired().await?;
        let mut stamp = Utc::now().timestamp_micros();
        let generation = loop {
            let candidate = GenerationId(format!("g{stamp}"));
            if !table_exists(&self.conn, &self.table_name(&candidate)).await.map_err(lance_err)? { break candidate; }
            stamp += 1;
        };
        ensure_table(&self.conn, &self.table_name(&generation), chunk_schema(self.dim)).await.map_err(lance_err)?;
        tracing::debug!(store = %self.name, generation = %generation, "created staging generation");
        Ok(generation)
    }

    async fn write_staging(&self, generation: &GenerationId, items: &[Chunk]) -> Result<()> {
        if self.cached_live()?.as_ref() == Some(generation) {
            return Err(Error::InvalidArgument(format!("generation {generation} is live, not staged")));
        }
        self.upsert_into(generation, items).await
    }

    async fn promote(&self, generation: &GenerationId) -> Result<()> {
        if !table_exists(&self.conn, &self.table_name(generation)).await.map_err(lance_err)? {
            return Err(Error::InvalidArgument(format!("unknown generation {generation}")));
        }
        let previous = self.cached_live()?;
        set_meta(&self.conn, &self.pointer_key(), &generation.0).await.map_err(lance_err)?;
        *self.live.lock().map_err(|_| poisoned())? = Some(generation.clone());
        tracing::info!(store = %self.name, generation = %generation, previous = ?previous, "promoted generation");
        if let Some(old) = previous.filter(|p| p != generation) {
            self.retired.lock().map_err(|_| poisoned())?.push(old);
        }
        Ok(())
    }

    async fn discard(&self, generation: &GenerationId) -> Result<()> {
        if self.cached_live()?.as_ref() == Some(generation) {
            return Err(Error::InvalidArgument(format!("refusing to discard live generation {generation}")));
        }
        drop_table_if_exists(&self.conn, &self.table_name(generation)).await.map_err(lance_err)?;
        self.forget_keyword(generation);
        tracing::debug!(store = %self.name, generation = %generation, "discarded staging generation");
        Ok(())
    }

    async fn live_generation(&self) -> Result<Option<GenerationId>> { self.cached_live() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn timeouts_classify_as_transient() {
        assert!(lance_err(anyhow!("request timed out after 30s")).is_transient());
        assert!(!lance_err(anyhow!("Table 'x' was not found")).is_transient());
    }
}
