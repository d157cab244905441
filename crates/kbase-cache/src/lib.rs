//! Content-addressed embedding cache.
//!
//! Vectors are keyed by `(model_id, sha256(normalized text))`. Concurrent
//! misses on one key share a single upstream call; provider failures are
//! retried with jittered exponential backoff.

pub mod cache;
pub mod key;
pub mod store;

pub use cache::{CacheStats, ContentCache};
pub use key::{normalize, CacheKey};
pub use store::{CacheStore, MemoryCacheStore};
