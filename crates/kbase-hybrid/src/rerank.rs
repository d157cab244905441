use async_trait::async_trait;

use kbase_core::{Reranker, Result, SearchResult};

use crate::merge::sort_by_score;

/// Reranks by blending the retrieval score with query-term overlap.
///
/// `rerank_score = 0.7 * score + 0.3 * (matched query terms / query terms)`.
#[derive(Debug, Clone, Copy)]
pub struct LexicalReranker {
    pub score_weight: f32,
}

impl Default for LexicalReranker {
    fn default() -> Self { Self { score_weight: 0.7 } }
}

#[async_trait]
impl Reranker for LexicalReranker {
    async fn rerank(&self, query: &str, mut candidates: Vec<SearchResult>, top_n: usize) -> Result<Vec<SearchResult>> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        for c in &mut candidates {
            let content = c.content.to_lowercase();
            let overlap = if terms.is_empty() { 0.0 } else { terms.iter().filter(|t| content.contains(*t)).count() as f32 / terms.len() as f32 };
            c.rerank_score = Some(self.score_weight * c.score + (1.0 - self.score_weight) * overlap);
        }
        sort_by_score(&mut candidates);
        candidates.truncate(top_n);
        Ok(candidates)
    }
}
