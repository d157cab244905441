//! LanceDB connection and housekeeping helpers.
//!
//! Tables are created empty on first use; a one-table key/value store
//! (`kbase_meta`) records pointers such as each store's live generation.
use anyhow::{Context, Result};
use arrow_array::{Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{ArrowError, Schema};
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::connection::ConnectBuilder;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection};
use std::sync::Arc;

use kbase_core::config::StoreSettings;

use crate::schema::{meta_schema, timestamps};

pub const META_TABLE: &str = "kbase_meta";

pub async fn open_db(settings: &StoreSettings) -> Result<Connection> {
    let builder = with_credentials(connect(&settings.uri), settings)?;
    builder.execute().await.with_context(|| format!("connecting to {}", settings.uri))
}

#[cfg(feature = "remote")]
fn with_credentials(builder: ConnectBuilder, settings: &StoreSettings) -> Result<ConnectBuilder> {
    Ok(match &settings.api_key {
        Some(key) => builder.api_key(key),
        None => builder,
    })
}

#[cfg(not(feature = "remote"))]
fn with_credentials(builder: ConnectBuilder, settings: &StoreSettings) -> Result<ConnectBuilder> {
    anyhow::ensure!(settings.api_key.is_none(), "store {} has an api_key but this build has no `remote` feature", settings.uri);
    Ok(builder)
}

pub async fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let names = conn.table_names().execute().await?;
    Ok(names.iter().any(|n| n == name))
}

/// Create `name` with zero rows unless it already exists.
pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<Schema>) -> Result<()> {
    if !table_exists(conn, name).await? {
        let empty = RecordBatchIterator::new(Vec::<std::result::Result<RecordBatch, ArrowError>>::new(), schema);
        conn.create_table(name, Box::new(empty)).execute().await.with_context(|| format!("creating table {name}"))?;
    }
    Ok(())
}

pub async fn drop_table_if_exists(conn: &Connection, name: &str) -> Result<()> {
    if table_exists(conn, name).await? {
        conn.drop_table(name, &[]).await.with_context(|| format!("dropping table {name}"))?;
    }
    Ok(())
}

/// Upsert one key. A single-row merge commits atomically.
pub async fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    ensure_table(conn, META_TABLE, meta_schema()).await?;
    let row = RecordBatch::try_new(
        meta_schema(),
        vec![
            Arc::new(StringArray::from(vec![key])),
            Arc::new(StringArray::from(vec![value])),
            Arc::new(timestamps(1, Utc::now().timestamp_millis())),
        ],
    )?;
    let table = conn.open_table(META_TABLE).execute().await?;
    let mut merge = table.merge_insert(&["key"]);
    merge.when_matched_update_all(None).when_not_matched_insert_all();
    merge.execute(Box::new(RecordBatchIterator::new(vec![Ok(row)], meta_schema()))).await?;
    Ok(())
}

pub async fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    if !table_exists(conn, META_TABLE).await? {
        return Ok(None);
    }
    let table = conn.open_table(META_TABLE).execute().await?;
    let filter = format!("key = '{}'", key.replace('\'', "''"));
    let batches: Vec<RecordBatch> = table.query().only_if(filter).limit(1).execute().await?.try_collect().await?;
    let Some(batch) = batches.into_iter().find(|b| b.num_rows() > 0) else {
        return Ok(None);
    };
    let values = batch
        .column_by_name("value")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .context("kbase_meta.value column missing")?;
    Ok((!values.is_null(0)).then(|| values.value(0).to_string()))
}
