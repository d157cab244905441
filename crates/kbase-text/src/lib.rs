//! kbase-text
//!
//! Tantivy keyword index used for the sparse pass of hybrid search. One
//! index mirrors one store generation; scores come back normalized to `[0, 1]`.
pub mod tantivy_utils;
pub mod index;

pub use index::KeywordIndex;
