use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kbase_cache::{ContentCache, MemoryCacheStore};
use kbase_core::{
    Chunk, CoverageConfig, EmbeddingProvider, Error, Meta, ModeSource, Result, Retriever, SearchQuery, SearchResult,
    SyncMode, VectorStore,
};
use kbase_coverage::{CoverageAssessor, GapReason, Priority};
use kbase_embed::HashEmbedder;
use kbase_hybrid::HybridSearcher;
use kbase_vector::MemoryStore;

/// Answers each area with fixed scores, optionally after a delay.
#[derive(Default)]
struct ScoreTable {
    scores: HashMap<String, Vec<f32>>,
    delays: HashMap<String, Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScoreTable {
    fn with(mut self, area: &str, scores: &[f32]) -> Self {
        self.scores.insert(area.into(), scores.to_vec());
        self
    }

    fn delayed(mut self, area: &str, ms: u64) -> Self {
        self.delays.insert(area.into(), Duration::from_millis(ms));
        self
    }
}

#[async_trait]
impl Retriever for ScoreTable {
    async fn retrieve(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(d) = self.delays.get(query.text()) {
            tokio::time::sleep(*d).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if query.text() == "boom" {
            return Err(Error::TransientConnection("store went away".into()));
        }
        let scores = self.scores.get(query.text()).cloned().unwrap_or_default();
        Ok(scores
            .into_iter()
            .take(query.top_k())
            .enumerate()
            .map(|(i, score)| SearchResult { id: format!("c{i}"), content: String::new(), metadata: Meta::new(), score, rerank_score: None })
            .collect())
    }
}

fn areas(names: &[&str]) -> Vec<String> { names.iter().map(|s| s.to_string()).collect() }

#[tokio::test]
async fn well_matched_area_is_covered() {
    let table = ScoreTable::default().with("system verification requirements", &[0.82]);
    let report = CoverageAssessor::new(Arc::new(table))
        .assess(&areas(&["system verification requirements"]), &CoverageConfig::default())
        .await
        .unwrap();

    assert_eq!(report.areas_evaluated, 1);
    assert!(report.gaps.is_empty());
    assert_eq!(report.covered.len(), 1);
    assert!((report.covered[0].avg_similarity - 0.82).abs() < 1e-6);
    assert_eq!(report.coverage_ratio, 1.0);
}

#[tokio::test]
async fn unmatched_area_is_a_no_content_gap() {
    let report = CoverageAssessor::new(Arc::new(ScoreTable::default()))
        .assess(&areas(&["nonexistent topic xyz"]), &CoverageConfig::default())
        .await
        .unwrap();

    assert!(report.covered.is_empty());
    let gap = &report.gaps[0];
    assert_eq!(gap.reason, GapReason::NoContent);
    assert_eq!(gap.confidence, 1.0);
    assert_eq!(gap.max_similarity, 0.0);
    assert_eq!(gap.priority, Priority::High);
    assert!(!gap.suggested_queries.is_empty());
    assert_eq!(report.coverage_ratio, 0.0);
}

#[tokio::test]
async fn every_area_lands_in_exactly_one_list_in_input_order() {
    let names = ["water", "power", "food", "shelter", "medicine", "tools"];
    let table = ScoreTable::default()
        .with("water", &[0.9, 0.7])
        .with("power", &[0.2, 0.1])
        .with("shelter", &[0.55])
        .with("tools", &[0.4; 10])
        .delayed("water", 60)
        .delayed("power", 40)
        .delayed("food", 20);
    let cfg = CoverageConfig { concurrency: 3, ..CoverageConfig::default() };
    let report = CoverageAssessor::new(Arc::new(table)).assess(&areas(&names), &cfg).await.unwrap();

    assert_eq!(report.gaps.len() + report.covered.len(), names.len());
    let covered: Vec<_> = report.covered.iter().map(|c| c.area.as_str()).collect();
    let gaps: Vec<_> = report.gaps.iter().map(|g| g.area.as_str()).collect();
    assert_eq!(covered, vec!["water", "shelter"]);
    assert_eq!(gaps, vec!["power", "food", "medicine", "tools"]);
    assert!((report.coverage_ratio - 2.0 / 6.0).abs() < 1e-6);

    let tools = &report.gaps[3];
    assert_eq!(tools.reason, GapReason::LowRelevance);
    assert_eq!(tools.priority, Priority::Medium);
    assert_eq!(report.gaps_at_least(Priority::High).count(), 3);
}

#[tokio::test]
async fn fan_out_respects_concurrency_limit() {
    let names: Vec<String> = (0..12).map(|i| format!("area {i}")).collect();
    let mut table = ScoreTable::default();
    for n in &names {
        table = table.delayed(n, 15);
    }
    let table = Arc::new(table);
    let cfg = CoverageConfig { concurrency: 4, ..CoverageConfig::default() };
    let report = CoverageAssessor::new(table.clone()).assess(&names, &cfg).await.unwrap();

    assert_eq!(report.gaps.len(), 12);
    assert!(table.peak.load(Ordering::SeqCst) <= 4);
}

#[tokio::test]
async fn identical_inputs_give_identical_reports() {
    let table = Arc::new(ScoreTable::default().with("a", &[0.3, 0.2, 0.1]).with("b", &[0.6]));
    let assessor = CoverageAssessor::new(table);
    let input = areas(&["a", "b", "c"]);
    let first = assessor.assess(&input, &CoverageConfig::default()).await.unwrap();
    let second = assessor.assess(&input, &CoverageConfig::default()).await.unwrap();
    assert_eq!(serde_json::to_string(&first).unwrap(), serde_json::to_string(&second).unwrap());
}

#[tokio::test]
async fn report_serializes_with_upper_case_priorities() {
    let report = CoverageAssessor::new(Arc::new(ScoreTable::default().with("ok", &[0.9])))
        .assess(&areas(&["missing", "ok"]), &CoverageConfig::default())
        .await
        .unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["gaps"][0]["priority"], "HIGH");
    assert_eq!(json["gaps"][0]["reason"], "no_content");
    assert_eq!(json["covered"][0]["tier"], "SUFFICIENT");
}

#[tokio::test]
async fn empty_input_is_an_empty_report_and_bad_config_is_rejected() {
    let assessor = CoverageAssessor::new(Arc::new(ScoreTable::default()));
    let report = assessor.assess(&[], &CoverageConfig::default()).await.unwrap();
    assert_eq!(report.areas_evaluated, 0);
    assert_eq!(report.coverage_ratio, 0.0);
    assert!(report.gaps.is_empty() && report.covered.is_empty());

    let skewed = CoverageConfig { similarity_weight: 0.9, ..CoverageConfig::default() };
    let err = assessor.assess(&areas(&["x"]), &skewed).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn search_failure_fails_the_assessment() {
    let assessor = CoverageAssessor::new(Arc::new(ScoreTable::default()));
    let err = assessor.assess(&areas(&["fine", "boom"]), &CoverageConfig::default()).await.unwrap_err();
    assert!(err.is_transient());
}

struct AlwaysOnline;

#[async_trait]
impl ModeSource for AlwaysOnline {
    async fn resolve_mode(&self) -> SyncMode { SyncMode::Online }
    fn report_primary_failure(&self, _reason: &str) {}
}

#[tokio::test]
async fn assesses_through_the_hybrid_searcher() -> anyhow::Result<()> {
    let embedder = Arc::new(HashEmbedder::new(1024));
    let primary = Arc::new(MemoryStore::new("primary", 1024)?);
    let docs = [("w", "rainwater harvesting"), ("s", "solar panel wiring")];
    let mut chunks = Vec::new();
    for (id, text) in docs {
        chunks.push(Chunk { id: id.into(), content: text.into(), metadata: Meta::new(), vector: embedder.embed(text).await? });
    }
    primary.insert(&chunks).await?;

    let cache = ContentCache::new(embedder, Arc::new(MemoryCacheStore::new()));
    let searcher = HybridSearcher::new(cache, primary, Arc::new(MemoryStore::new("fallback", 1024)?), Arc::new(AlwaysOnline));
    let report = CoverageAssessor::new(Arc::new(searcher))
        .assess(&areas(&["rainwater harvesting", "goat husbandry"]), &CoverageConfig::default())
        .await?;

    assert_eq!(report.covered.len(), 1);
    assert_eq!(report.covered[0].area, "rainwater harvesting");
    assert_eq!(report.gaps[0].area, "goat husbandry");
    assert_eq!(report.gaps[0].priority, Priority::High);
    Ok(())
}
