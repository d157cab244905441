use std::collections::BTreeMap;

use kbase_core::{RawResult, SearchResult};

/// `(1 - w) * dense + w * sparse`. A pass that missed the item contributes 0.
pub fn combine(dense: f32, sparse: f32, sparse_weight: f32) -> f32 { (1.0 - sparse_weight) * dense + sparse_weight * sparse }

/// Fuse a dense and a keyword pass by id, sorted by combined score descending (ties by id).
pub fn merge_passes(dense: Vec<RawResult>, sparse: Vec<RawResult>, sparse_weight: f32) -> Vec<SearchResult> {
    let mut by_id: BTreeMap<String, (RawResult, f32, f32)> = BTreeMap::new();
    for hit in dense {
        let s = hit.similarity;
        by_id.insert(hit.id.clone(), (hit, s, 0.0));
    }
    for hit in sparse {
        let s = hit.similarity;
        by_id.entry(hit.id.clone()).and_modify(|e| e.2 = s).or_insert((hit, 0.0, s));
    }
    let mut merged: Vec<SearchResult> = by_id
        .into_values()
        .map(|(hit, d, s)| SearchResult { id: hit.id, content: hit.content, metadata: hit.metadata, score: combine(d, s, sparse_weight), rerank_score: None })
        .collect();
    sort_by_score(&mut merged);
    merged
}

pub(crate) fn sort_by_score(results: &mut [SearchResult]) {
    results.sort_by(|a, b| b.rank_score().total_cmp(&a.rank_score()).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbase_core::Meta;

    fn hit(id: &str, similarity: f32) -> RawResult { RawResult { id: id.into(), content: String::new(), metadata: Meta::new(), similarity } }

    #[test]
    fn weighted_fusion_of_both_passes() {
        let merged = merge_passes(vec![hit("x", 0.9)], vec![hit("x", 0.4)], 0.3);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].score - 0.75).abs() < 1e-6);
    }

    #[test]
    fn single_pass_items_keep_their_weighted_score() {
        let merged = merge_passes(vec![hit("dense", 0.8)], vec![hit("sparse", 1.0)], 0.3);
        let score = |id: &str| merged.iter().find(|r| r.id == id).map(|r| r.score);
        assert!((score("dense").unwrap() - 0.56).abs() < 1e-6);
        assert!((score("sparse").unwrap() - 0.3).abs() < 1e-6);
        assert_eq!(merged[0].id, "dense");
    }

    #[test]
    fn higher_dense_score_never_lowers_combined_score() {
        for w in [0.0f32, 0.1, 0.3, 0.5, 0.9, 1.0] {
            for sparse in [0.0f32, 0.25, 0.5, 1.0] {
                let mut prev = f32::NEG_INFINITY;
                for step in 0..=20 {
                    let dense = step as f32 / 20.0;
                    let combined = combine(dense, sparse, w);
                    assert!(combined >= prev, "w={w} sparse={sparse} dense={dense}");
                    prev = combined;
                }
            }
        }
    }

    #[test]
    fn ties_break_by_id() {
        let merged = merge_passes(vec![hit("b", 0.5), hit("a", 0.5)], vec![], 0.0);
        assert_eq!(merged.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
