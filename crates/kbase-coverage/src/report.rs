use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    NoContent,
    LowRelevance,
}

/// Ordered so `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoverageTier {
    Sufficient,
}

/// A knowledge area whose best match falls below the similarity threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub area: String,
    pub reason: GapReason,
    /// Uncertainty that the area is covered, in `[0, 1]`.
    pub confidence: f32,
    pub max_similarity: f32,
    pub priority: Priority,
    pub suggested_queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoveredArea {
    pub area: String,
    pub chunk_count: usize,
    pub avg_similarity: f32,
    pub tier: CoverageTier,
}

/// Outcome of one assessment. Every input area is in exactly one of
/// `gaps` or `covered`, and both lists keep input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub areas_evaluated: usize,
    pub coverage_ratio: f32,
    pub gaps: Vec<Gap>,
    pub covered: Vec<CoveredArea>,
}

impl CoverageReport {
    /// Gaps at or above `priority`.
    pub fn gaps_at_least(&self, priority: Priority) -> impl Iterator<Item = &Gap> {
        self.gaps.iter().filter(move |g| g.priority >= priority)
    }
}
