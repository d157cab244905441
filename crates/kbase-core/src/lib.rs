//! Shared vocabulary of the kbase engine: domain types, collaborator
//! traits, the error taxonomy and layered configuration.
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{EmbedError, Error, Result};
pub use traits::{EmbeddingProvider, GenerationId, GenerationalStore, ModeSource, Reranker, Retriever, VectorStore};
pub use types::{
    Chunk, ChunkId, CoverageConfig, Meta, RawResult, SearchMode, SearchQuery, SearchResult, StoreRole, SyncMode,
    SyncPhase, SyncResult, SyncState, META_DEGRADED, META_SERVED_BY,
};
