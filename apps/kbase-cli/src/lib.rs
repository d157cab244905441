//! Library side of the `kbase` operator binary.
pub mod app;
pub mod ingest;

pub use app::Engine;
