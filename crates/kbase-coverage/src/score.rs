//! Pure scoring for one knowledge area: entropy, confidence, priority and
//! the gap/covered decision. No I/O, so the same scores always give the
//! same verdict.
use kbase_core::CoverageConfig;

use crate::report::{CoverageTier, CoveredArea, Gap, GapReason, Priority};

pub enum Verdict {
    Covered(CoveredArea),
    Gap(Gap),
}

/// Shannon entropy of `p_i = s_i / Σs`, divided by `ln(n)`.
///
/// All-zero scores carry no signal and count as maximal uncertainty (1.0).
/// A single score has no spread and gives 0.
pub fn normalized_entropy(scores: &[f32]) -> f32 {
    let total: f64 = scores.iter().map(|&s| f64::from(s.max(0.0))).sum();
    if total <= 0.0 {
        return 1.0;
    }
    if scores.len() < 2 {
        return 0.0;
    }
    let entropy: f64 = scores
        .iter()
        .map(|&s| f64::from(s.max(0.0)) / total)
        .filter(|&p| p > 0.0)
        .map(|p| -p * p.ln())
        .sum();
    (entropy / (scores.len() as f64).ln()).clamp(0.0, 1.0) as f32
}

/// Weighted uncertainty that an area is covered, clamped to `[0, 1]`.
pub fn confidence(scores: &[f32], max_similarity: f32, config: &CoverageConfig) -> f32 {
    let count_factor = 1.0 - (scores.len() as f32 / config.n_results as f32).min(1.0);
    let raw = config.similarity_weight * (1.0 - max_similarity)
        + config.entropy_weight * normalized_entropy(scores)
        + config.count_weight * count_factor;
    raw.clamp(0.0, 1.0)
}

pub fn priority(max_similarity: f32, confidence: f32, config: &CoverageConfig) -> Priority {
    if max_similarity < config.high_confidence_threshold || confidence > config.confidence_escalation_threshold {
        Priority::High
    } else if confidence > config.confidence_medium_threshold {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Follow-up queries an operator can run to fill a gap.
pub fn suggested_queries(area: &str, reason: GapReason) -> Vec<String> {
    let area = area.split_whitespace().collect::<Vec<_>>().join(" ");
    if area.is_empty() {
        return Vec::new();
    }
    let mut out = match reason {
        GapReason::NoContent => vec![format!("{area} overview"), format!("{area} guide"), format!("what is {area}")],
        GapReason::LowRelevance => vec![format!("{area} details"), format!("{area} examples"), format!("{area} step by step")],
    };
    let words: Vec<&str> = area.split(' ').filter(|w| w.chars().count() > 3).collect();
    if words.len() > 1 {
        out.push(words.join(" OR "));
    }
    out
}

pub fn classify(area: &str, scores: &[f32], config: &CoverageConfig) -> Verdict {
    if scores.is_empty() {
        return Verdict::Gap(Gap {
            area: area.to_string(),
            reason: GapReason::NoContent,
            confidence: 1.0,
            max_similarity: 0.0,
            priority: Priority::High,
            suggested_queries: suggested_queries(area, GapReason::NoContent),
        });
    }

    let max_similarity = scores.iter().copied().fold(f32::MIN, f32::max);
    if max_similarity >= config.similarity_threshold {
        let avg_similarity = scores.iter().sum::<f32>() / scores.len() as f32;
        return Verdict::Covered(CoveredArea {
            area: area.to_string(),
            chunk_count: scores.len(),
            avg_similarity,
            tier: CoverageTier::Sufficient,
        });
    }

    let confidence = confidence(scores, max_similarity, config);
    Verdict::Gap(Gap {
        area: area.to_string(),
        reason: GapReason::LowRelevance,
        confidence,
        max_similarity,
        priority: priority(max_similarity, confidence, config),
        suggested_queries: suggested_queries(area, GapReason::LowRelevance),
    })
}
