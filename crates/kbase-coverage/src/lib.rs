//! Knowledge-coverage assessment over a [`kbase_core::Retriever`].
pub mod assessor;
pub mod report;
pub mod score;

pub use assessor::CoverageAssessor;
pub use report::{CoverageReport, CoverageTier, CoveredArea, Gap, GapReason, Priority};
