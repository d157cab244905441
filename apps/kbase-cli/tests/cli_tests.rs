use std::io::Cursor;
use std::sync::Arc;

use kbase_cache::{ContentCache, MemoryCacheStore};
use kbase_cli::ingest::{ingest, read_records};
use kbase_cli::Engine;
use kbase_core::config::Settings;
use kbase_core::{StoreRole, VectorStore};
use kbase_embed::HashEmbedder;
use kbase_vector::MemoryStore;

const JSONL: &str = r#"{"id": "w1", "content": "rain barrel overflow valve", "metadata": {"topic": "water"}}

{"id": "p1", "content": "solar charge controller wiring", "metadata": {"topic": "power"}}
{"id": "f1", "content": "pressure canning green beans"}
"#;

#[test]
fn reads_records_and_skips_blank_lines() {
    let records = read_records(Cursor::new(JSONL)).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].metadata.get("topic").map(String::as_str), Some("water"));
    assert!(records[2].metadata.is_empty());
}

#[test]
fn bad_lines_are_reported_by_number() {
    let err = read_records(Cursor::new("{\"id\": \"a\", \"content\": \"ok\"}\nnot json\n")).unwrap_err();
    assert!(format!("{err:#}").contains("line 2"));

    let err = read_records(Cursor::new("{\"id\": \"a\", \"content\": \"   \"}\n")).unwrap_err();
    assert!(err.to_string().contains("no content"));
}

#[tokio::test]
async fn ingest_embeds_through_the_cache() {
    let cache = ContentCache::new(Arc::new(HashEmbedder::new(16)), Arc::new(MemoryCacheStore::new()));
    let store = MemoryStore::new("primary", 16).unwrap();
    let records = read_records(Cursor::new(JSONL)).unwrap();

    assert_eq!(ingest(&cache, &store, records.clone(), 2).await.unwrap(), 3);
    assert_eq!(store.count().await.unwrap(), 3);
    assert_eq!(cache.stats().upstream_calls, 2);

    ingest(&cache, &store, records, 2).await.unwrap();
    assert_eq!(cache.stats().upstream_calls, 2);
    assert_eq!(store.count().await.unwrap(), 3);
}

#[tokio::test]
async fn engine_ingests_syncs_and_searches() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut settings = Settings::default();
    settings.primary.uri = tmp.path().join("primary").to_string_lossy().into_owned();
    settings.fallback.uri = tmp.path().join("fallback").to_string_lossy().into_owned();
    settings.cache.uri = tmp.path().join("cache").to_string_lossy().into_owned();
    settings.embedding.dim = 64;
    settings.sync.page_size = 2;

    let engine = Engine::open(settings).await?;
    let inserted = ingest(&engine.cache, engine.primary.as_ref(), read_records(Cursor::new(JSONL))?, 10).await?;
    assert_eq!(inserted, 3);

    let result = engine.sync.sync().await;
    assert!(result.success, "{:?}", result.reason);
    assert_eq!(result.items_copied, 3);
    assert_eq!(engine.fallback.count().await?, 3);

    let query = engine.query("rain barrel", true, Some(2), 0.0, Default::default())?;
    let hits = engine.searcher.search(&query).await?;
    assert_eq!(hits[0].id, "w1");
    assert_eq!(hits[0].served_by(), Some(StoreRole::Primary));

    let report = engine.assessor().assess(&["rain barrel overflow valve".to_string()], &engine.settings.coverage).await?;
    assert_eq!(report.covered.len(), 1);
    Ok(())
}
