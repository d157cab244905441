use tantivy::schema::{Schema, TextFieldIndexing, TextOptions, IndexRecordOption, STRING, STORED};
use tantivy::tokenizer::{TextAnalyzer, SimpleTokenizer, LowerCaser, StopWordFilter};
use tantivy::Index;

pub const ID: &str = "id";
pub const CONTENT: &str = "content";
pub const METADATA: &str = "metadata";
/// Indexed-only `key=value` terms used for exact-match filters.
pub const META_KV: &str = "meta_kv";

const TOKENIZER: &str = "text_with_stopwords";

pub fn build_schema() -> Schema {
	let mut schema_builder = Schema::builder();
	schema_builder.add_text_field(ID, STRING | STORED);
	let text_field_indexing = TextFieldIndexing::default().set_tokenizer(TOKENIZER).set_index_option(IndexRecordOption::WithFreqsAndPositions);
	let text_options = TextOptions::default().set_indexing_options(text_field_indexing).set_stored();
	schema_builder.add_text_field(CONTENT, text_options);
	schema_builder.add_text_field(METADATA, STORED);
	schema_builder.add_text_field(META_KV, STRING);
	schema_builder.build()
}

/// Term stored in [`META_KV`] for one metadata pair.
pub fn meta_term(key: &str, value: &str) -> String { format!("{key}\u{1f}{value}") }

pub fn register_tokenizer(index: &Index) {
	let stop_words = [
		"a","an","and","are","as","at","be","by","for","from","has","he","in","is","it","its","of","on","that","the","to","was","will","with","or","but","not","this","these","they","them","their","there","then","than","so","if","when","where","why","how","what","which","who","whom","whose","can","could","should","would","may","might","must","shall","do","does","did","have","had","having",
	];
	let tokenizer = TextAnalyzer::builder(SimpleTokenizer::default())
		.filter(LowerCaser)
		.filter(StopWordFilter::remove(stop_words.iter().map(|s| s.to_string())))
		.build();
	index.tokenizers().register(TOKENIZER, tokenizer);
}
