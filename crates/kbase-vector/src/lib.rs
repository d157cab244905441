//! Vector store clients.
//!
//! [`LanceStore`] keeps each generation in its own LanceDB table and flips a
//! pointer in a meta table to promote one. [`MemoryStore`] is the in-process
//! equivalent. [`LanceCacheStore`] persists the embedding cache in LanceDB.
pub mod cache;
pub mod filters;
pub mod lance;
pub mod memory;
pub mod schema;
pub mod table;

pub use cache::LanceCacheStore;
pub use lance::LanceStore;
pub use memory::MemoryStore;
