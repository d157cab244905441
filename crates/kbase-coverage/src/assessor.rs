use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Instant;

use kbase_core::{CoverageConfig, Error, Meta, Result, Retriever, SearchQuery};

use crate::report::CoverageReport;
use crate::score::{classify, Verdict};

/// Runs one semantic search per knowledge area and scores how well the
/// knowledge base covers each.
pub struct CoverageAssessor {
    retriever: Arc<dyn Retriever>,
    filters: Meta,
}

impl CoverageAssessor {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self { Self { retriever, filters: Meta::new() } }

    /// Restrict every area search to chunks matching `filters`.
    pub fn with_filters(mut self, filters: Meta) -> Self {
        self.filters = filters;
        self
    }

    /// Areas are searched with at most `config.concurrency` in flight; the
    /// report lists them in input order. The first failed search fails the
    /// whole assessment. An empty `areas` yields an empty report.
    pub async fn assess(&self, areas: &[String], config: &CoverageConfig) -> Result<CoverageReport> {
        config.validate().map_err(|e| match e {
            Error::Configuration(msg) => Error::InvalidArgument(msg),
            other => other,
        })?;
        let started = Instant::now();

        let verdicts: Vec<Verdict> = futures::stream::iter(areas)
            .map(|area| self.assess_area(area, config))
            .buffered(config.concurrency)
            .try_collect()
            .await?;

        let mut report = CoverageReport { areas_evaluated: areas.len(), ..CoverageReport::default() };
        for verdict in verdicts {
            match verdict {
                Verdict::Covered(c) => report.covered.push(c),
                Verdict::Gap(g) => report.gaps.push(g),
            }
        }
        if !areas.is_empty() {
            report.coverage_ratio = report.covered.len() as f32 / areas.len() as f32;
        }
        tracing::info!(
            areas = areas.len(),
            covered = report.covered.len(),
            gaps = report.gaps.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "coverage assessed"
        );
        Ok(report)
    }

    async fn assess_area(&self, area: &str, config: &CoverageConfig) -> Result<Verdict> {
        if area.trim().is_empty() {
            return Ok(classify(area, &[], config));
        }
        let query = SearchQuery::builder(area).top_k(config.n_results).filters(self.filters.clone()).build()?;
        let results = self.retriever.retrieve(&query).await?;
        let scores: Vec<f32> = results.iter().map(|r| r.score).collect();
        tracing::debug!(area, hits = scores.len(), "area searched");
        Ok(classify(area, &scores, config))
    }
}
