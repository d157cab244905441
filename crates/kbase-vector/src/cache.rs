//! Lance-backed embedding cache keyed by `(model_id, content_hash)`.
//!
//! Rows carry their insertion time; eviction drops the oldest rows first.
//! A row whose vector cannot be decoded is reported as unreadable so the
//! content cache recomputes and overwrites it.
use anyhow::anyhow;
use arrow_array::{RecordBatch, RecordBatchIterator, StringArray, TimestampMillisecondArray};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::Connection;
use std::sync::Arc;

use kbase_cache::{CacheKey, CacheStore};
use kbase_core::config::{CacheSettings, StoreSettings};
use kbase_core::{Error, Result};

use crate::lance::lance_err;
use crate::schema::{cache_schema, string_column, timestamps, vector_at, vector_column, vectors_array};
use crate::table::{ensure_table, open_db};

const DELETE_CHUNK: usize = 500;

pub struct LanceCacheStore {
    conn: Connection,
    table: String,
    dim: usize,
}

impl LanceCacheStore {
    pub async fn open(settings: &CacheSettings, dim: usize) -> Result<Self> {
        let store_settings = StoreSettings { uri: settings.uri.clone(), collection: settings.table.clone(), api_key: None };
        let conn = open_db(&store_settings).await.map_err(|e| Error::Configuration(format!("cannot open cache at {}: {e:#}", settings.uri)))?;
        ensure_table(&conn, &settings.table, cache_schema(dim)).await.map_err(lance_err)?;
        Ok(Self { conn, table: settings.table.clone(), dim })
    }

    fn row_key(key: &CacheKey) -> String { format!("{}:{}", key.model_id(), key.digest_hex()) }

    fn row_bytes(&self) -> u64 { (self.dim * 4 + 128) as u64 }

    async fn table(&self) -> Result<lancedb::Table> { self.conn.open_table(&self.table).execute().await.map_err(lance_err) }
}

fn quote(s: &str) -> String { format!("'{}'", s.replace('\'', "''")) }

#[async_trait]
impl CacheStore for LanceCacheStore {
    async fn load(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> {
        let t = self.table().await?;
        let mut stream = t.query().only_if(format!("key = {}", quote(&Self::row_key(key)))).limit(1).execute().await.map_err(lance_err)?;
        while let Some(batch) = stream.try_next().await.map_err(lance_err)? {
            if batch.num_rows() == 0 { continue; }
            let vectors = vector_column(&batch).map_err(lance_err)?;
            return match vector_at(vectors, 0, self.dim) {
                Some(v) => Ok(Some(v)),
                None => Err(Error::Store(format!("cache row {} has an unreadable vector", key.digest_hex()))),
            };
        }
        Ok(None)
    }

    async fn store(&self, key: &CacheKey, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::InvalidArgument(format!("vector has {} dims, cache expects {}", vector.len(), self.dim)));
        }
        let t = self.table().await?;
        let batch = RecordBatch::try_new(
            cache_schema(self.dim),
            vec![
                Arc::new(StringArray::from(vec![Self::row_key(key)])),
                Arc::new(StringArray::from(vec![key.model_id().to_string()])),
                Arc::new(StringArray::from(vec![key.digest_hex()])),
                Arc::new(timestamps(1, Utc::now().timestamp_millis())),
                Arc::new(vectors_array(std::iter::once(vector), self.dim)),
            ],
        )
        .map_err(lance_err)?;
        let reader = Box::new(RecordBatchIterator::new(vec![Ok(batch)].into_iter(), cache_schema(self.dim)));
        let mut mi = t.merge_insert(&["key"]);
        mi.when_matched_update_all(None).when_not_matched_insert_all();
        mi.execute(reader).await.map_err(lance_err)?;
        Ok(())
    }

    async fn footprint(&self) -> Result<u64> {
        let rows = self.table().await?.count_rows(None).await.map_err(lance_err)?;
        Ok(rows as u64 * self.row_bytes())
    }

    async fn evict_to(&self, max_bytes: u64) -> Result<usize> {
        let t = self.table().await?;
        let rows = t.count_rows(None).await.map_err(lance_err)?;
        let keep = (max_bytes / self.row_bytes()) as usize;
        if rows <= keep { return Ok(0); }

        let mut aged: Vec<(i64, String)> = Vec::with_capacity(rows);
        let mut stream = t.query().select(Select::columns(&["key", "created_at"])).execute().await.map_err(lance_err)?;
        while let Some(batch) = stream.try_next().await.map_err(lance_err)? {
            let keys = string_column(&batch, "key").map_err(lance_err)?;
            let created = batch
                .column_by_name("created_at")
                .and_then(|c| c.as_any().downcast_ref::<TimestampMillisecondArray>())
                .ok_or_else(|| lance_err(anyhow!("created_at column missing")))?;
            for i in 0..batch.num_rows() { aged.push((created.value(i), keys.value(i).to_string())); }
        }
        aged.sort();
        let victims: Vec<String> = aged.into_iter().take(rows - keep).map(|(_, k)| quote(&k)).collect();
        for chunk in victims.chunks(DELETE_CHUNK) {
            t.delete(&format!("key IN ({})", chunk.join(", "))).await.map_err(lance_err)?;
        }
        tracing::debug!(table = %self.table, evicted = victims.len(), "evicted oldest cache rows");
        Ok(victims.len())
    }
}
