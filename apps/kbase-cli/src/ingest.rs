//! Loads pre-chunked JSON lines into a store, embedding through the cache.
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::io::BufRead;

use kbase_cache::ContentCache;
use kbase_core::{Chunk, Meta, VectorStore};

/// One line of an ingest file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IngestRecord {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Meta,
}

/// Parse JSON lines, skipping blank ones. Errors name the offending line.
pub fn read_records(reader: impl BufRead) -> Result<Vec<IngestRecord>> {
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", i + 1))?;
        if line.trim().is_empty() { continue; }
        let record: IngestRecord = serde_json::from_str(&line).with_context(|| format!("line {} is not a valid record", i + 1))?;
        anyhow::ensure!(!record.id.is_empty(), "line {} has an empty id", i + 1);
        anyhow::ensure!(!record.content.trim().is_empty(), "line {} has no content", i + 1);
        out.push(record);
    }
    Ok(out)
}

/// Embed and insert `records` in batches of `batch_size`. Returns the number inserted.
pub async fn ingest(cache: &ContentCache, store: &dyn VectorStore, records: Vec<IngestRecord>, batch_size: usize) -> Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }
    let pb = ProgressBar::new(records.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );
    let mut inserted = 0;
    for batch in records.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|r| r.content.clone()).collect();
        let vectors = cache.get_or_compute_batch(&texts).await?;
        let chunks: Vec<Chunk> = batch
            .iter()
            .zip(vectors)
            .map(|(r, vector)| Chunk { id: r.id.clone(), content: r.content.clone(), metadata: r.metadata.clone(), vector })
            .collect();
        store.insert(&chunks).await?;
        inserted += chunks.len();
        pb.set_position(inserted as u64);
    }
    pb.finish_with_message("ingest complete");
    Ok(inserted)
}
