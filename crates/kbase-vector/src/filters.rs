use kbase_core::Meta;

/// Every filter pair is present in `metadata` with an equal value.
pub fn matches(metadata: &Meta, filters: &Meta) -> bool {
    filters.iter().all(|(k, v)| metadata.get(k) == Some(v))
}

/// Cosine similarity clamped to `[0, 1]`; zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0f32, 0f32, 0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 { return 0.0; }
    (dot / (na.sqrt() * nb.sqrt())).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_need_every_pair() {
        let mut meta = Meta::new();
        meta.insert("lang".into(), "en".into());
        meta.insert("kind".into(), "manual".into());
        let mut filters = Meta::new();
        assert!(matches(&meta, &filters));
        filters.insert("lang".into(), "en".into());
        assert!(matches(&meta, &filters));
        filters.insert("kind".into(), "faq".into());
        assert!(!matches(&meta, &filters));
    }

    #[test]
    fn cosine_is_clamped() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
