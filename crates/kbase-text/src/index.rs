use anyhow::{Result, anyhow};
use std::path::Path;
use std::sync::Mutex;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use kbase_core::{Chunk, Meta, RawResult};

use crate::tantivy_utils::{build_schema, meta_term, register_tokenizer, CONTENT, ID, METADATA, META_KV};

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// A BM25 keyword index over chunk content with exact-match metadata filters.
pub struct KeywordIndex {
	index: Index,
	reader: IndexReader,
	/// Opened on first write so read-only handles never take the directory lock.
	writer: Mutex<Option<IndexWriter>>,
	id_field: Field,
	content_field: Field,
	metadata_field: Field,
	meta_kv_field: Field,
}

impl KeywordIndex {
	/// Fresh index in `dir`, replacing anything already there.
	pub fn create_in_dir(dir: &Path) -> Result<Self> {
		if dir.exists() { std::fs::remove_dir_all(dir)?; }
		std::fs::create_dir_all(dir)?;
		Self::from_index(Index::create_in_dir(dir, build_schema())?)
	}

	pub fn open_or_create(dir: &Path) -> Result<Self> {
		std::fs::create_dir_all(dir)?;
		let directory = MmapDirectory::open(dir)?;
		Self::from_index(Index::open_or_create(directory, build_schema())?)
	}

	pub fn in_ram() -> Result<Self> { Self::from_index(Index::create_in_ram(build_schema())) }

	fn from_index(index: Index) -> Result<Self> {
		register_tokenizer(&index);
		let schema = index.schema();
		let id_field = schema.get_field(ID)?;
		let content_field = schema.get_field(CONTENT)?;
		let metadata_field = schema.get_field(METADATA)?;
		let meta_kv_field = schema.get_field(META_KV)?;
		let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
		Ok(Self { index, reader, writer: Mutex::new(None), id_field, content_field, metadata_field, meta_kv_field })
	}

	/// Insert or replace chunks by id, then commit and refresh the reader.
	pub fn upsert(&self, chunks: &[Chunk]) -> Result<()> {
		if chunks.is_empty() { return Ok(()); }
		let mut guard = self.writer.lock().map_err(|_| anyhow!("keyword index writer poisoned"))?;
		if guard.is_none() { *guard = Some(self.index.writer(WRITER_HEAP_BYTES)?); }
		let writer = guard.as_mut().ok_or_else(|| anyhow!("keyword index writer unavailable"))?;
		for c in chunks {
			writer.delete_term(Term::from_field_text(self.id_field, &c.id));
			let mut doc = TantivyDocument::default();
			doc.add_text(self.id_field, &c.id);
			doc.add_text(self.content_field, &c.content);
			doc.add_text(self.metadata_field, serde_json::to_string(&c.metadata)?);
			for (k, v) in &c.metadata { doc.add_text(self.meta_kv_field, meta_term(k, v)); }
			writer.add_document(doc)?;
		}
		writer.commit()?;
		drop(guard);
		self.reader.reload()?;
		Ok(())
	}

	pub fn len(&self) -> u64 { self.reader.searcher().num_docs() }

	pub fn is_empty(&self) -> bool { self.len() == 0 }

	/// Top `top_k` matches for `text` among chunks whose metadata contains every filter pair.
	///
	/// Similarities are BM25 scores divided by the best score of the call, so
	/// the strongest match is `1.0`.
	pub fn search(&self, text: &str, filters: &Meta, top_k: usize) -> Result<Vec<RawResult>> {
		if text.trim().is_empty() || top_k == 0 { return Ok(Vec::new()); }
		let parser = QueryParser::for_index(&self.index, vec![self.content_field]);
		let (text_query, errors) = parser.parse_query_lenient(text);
		if !errors.is_empty() { tracing::debug!(?errors, "lenient keyword parse dropped query parts"); }
		let query: Box<dyn Query> = if filters.is_empty() { text_query } else {
			let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(Occur::Must, text_query)];
			for (k, v) in filters {
				let term = Term::from_field_text(self.meta_kv_field, &meta_term(k, v));
				clauses.push((Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic))));
			}
			Box::new(BooleanQuery::new(clauses))
		};
		let searcher = self.reader.searcher();
		let top_docs = searcher.search(&query, &TopDocs::with_limit(top_k))?;
		let best = top_docs.first().map(|(s, _)| *s).unwrap_or(0.0);
		let mut out = Vec::with_capacity(top_docs.len());
		for (score, addr) in top_docs {
			let doc: TantivyDocument = searcher.doc(addr)?;
			let id = doc.get_first(self.id_field).and_then(|v| v.as_str()).unwrap_or("").to_string();
			let content = doc.get_first(self.content_field).and_then(|v| v.as_str()).unwrap_or("").to_string();
			let metadata: Meta = match doc.get_first(self.metadata_field).and_then(|v| v.as_str()) {
				Some(raw) => serde_json::from_str(raw)?,
				None => Meta::new(),
			};
			let similarity = if best > 0.0 { (score / best).clamp(0.0, 1.0) } else { 0.0 };
			out.push(RawResult { id, content, metadata, similarity });
		}
		Ok(out)
	}
}
