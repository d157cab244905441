use anyhow::{anyhow, Result};
use arrow_array::cast::AsArray;
use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, StringArray, TimestampMillisecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use std::sync::Arc;

use kbase_core::{Chunk, Meta};

pub fn vector_field(dim: usize) -> Field {
	Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim as i32), true)
}

/// One row per chunk; `metadata` is a JSON object of strings.
pub fn chunk_schema(dim: usize) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("id", DataType::Utf8, false),
		Field::new("content", DataType::Utf8, false),
		Field::new("metadata", DataType::Utf8, false),
		vector_field(dim),
	]))
}

/// Embedding cache rows keyed by `(model_id, content_hash)`.
pub fn cache_schema(dim: usize) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("key", DataType::Utf8, false),
		Field::new("model_id", DataType::Utf8, false),
		Field::new("content_hash", DataType::Utf8, false),
		Field::new("created_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
		vector_field(dim),
	]))
}

pub fn meta_schema() -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("key", DataType::Utf8, false),
		Field::new("value", DataType::Utf8, false),
		Field::new("updated_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
	]))
}

pub fn vectors_array<'a>(vectors: impl Iterator<Item = &'a [f32]>, dim: usize) -> FixedSizeListArray {
	let rows: Vec<Option<Vec<Option<f32>>>> = vectors.map(|v| Some(v.iter().map(|&x| Some(x)).collect())).collect();
	FixedSizeListArray::from_iter_primitive::<arrow_array::types::Float32Type, _, _>(rows.into_iter(), dim as i32)
}

pub fn chunks_to_batch(chunks: &[Chunk], dim: usize) -> Result<RecordBatch> {
	let mut ids = Vec::with_capacity(chunks.len());
	let mut contents = Vec::with_capacity(chunks.len());
	let mut metas = Vec::with_capacity(chunks.len());
	for c in chunks {
		if c.vector.len() != dim { return Err(anyhow!("chunk {} has {} dims, store expects {}", c.id, c.vector.len(), dim)); }
		ids.push(c.id.clone());
		contents.push(c.content.clone());
		metas.push(serde_json::to_string(&c.metadata)?);
	}
	let batch = RecordBatch::try_new(chunk_schema(dim), vec![
		Arc::new(StringArray::from(ids)),
		Arc::new(StringArray::from(contents)),
		Arc::new(StringArray::from(metas)),
		Arc::new(vectors_array(chunks.iter().map(|c| c.vector.as_slice()), dim)),
	])?;
	Ok(batch)
}

pub fn timestamps(n: usize, millis: i64) -> TimestampMillisecondArray { TimestampMillisecondArray::from(vec![millis; n]) }

pub fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
	batch.column_by_name(name).and_then(|c| c.as_any().downcast_ref::<StringArray>()).ok_or_else(|| anyhow!("{name} column missing"))
}

/// Row `i` of a vector column; `None` for a null or wrongly sized entry.
pub fn vector_at(col: &FixedSizeListArray, i: usize, dim: usize) -> Option<Vec<f32>> {
	if !col.is_valid(i) { return None; }
	let vals = col.value(i);
	let vals = vals.as_primitive::<arrow_array::types::Float32Type>();
	if vals.len() != dim || vals.null_count() > 0 { return None; }
	Some(vals.values().to_vec())
}

pub fn vector_column<'a>(batch: &'a RecordBatch) -> Result<&'a FixedSizeListArray> {
	batch.column_by_name("vector").and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>()).ok_or_else(|| anyhow!("vector column missing"))
}

/// Decode chunk rows, paired with `_distance` when the batch came from a vector search.
pub fn batch_to_chunks(batch: &RecordBatch, dim: usize) -> Result<Vec<(Chunk, Option<f32>)>> {
	let ids = string_column(batch, "id")?;
	let contents = string_column(batch, "content")?;
	let metas = string_column(batch, "metadata")?;
	let vectors = vector_column(batch)?;
	let distances = batch.column_by_name("_distance").and_then(|c| c.as_any().downcast_ref::<Float32Array>());
	let mut out = Vec::with_capacity(batch.num_rows());
	for i in 0..batch.num_rows() {
		let metadata: Meta = serde_json::from_str(metas.value(i))?;
		let vector = vector_at(vectors, i, dim).ok_or_else(|| anyhow!("row {} has an unreadable vector", ids.value(i)))?;
		let chunk = Chunk { id: ids.value(i).to_string(), content: contents.value(i).to_string(), metadata, vector };
		out.push((chunk, distances.map(|d| d.value(i))));
	}
	Ok(out)
}
