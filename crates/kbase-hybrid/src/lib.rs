//! Query-time retrieval: store selection, dense and keyword passes, score
//! fusion and optional reranking.
pub mod merge;
pub mod rerank;
pub mod searcher;

pub use merge::{combine, merge_passes};
pub use rerank::LexicalReranker;
pub use searcher::{HybridSearcher, SearchOptions};
