use sha2::{Digest, Sha256};

/// Trim, collapse internal whitespace runs to one space, and case-fold.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}

/// Identity of one cached vector. Keys from different models never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    model_id: String,
    digest: [u8; 32],
}

impl CacheKey {
    /// Key for `text`, which is normalized first.
    pub fn for_text(model_id: &str, text: &str) -> Self { Self::for_normalized(model_id, &normalize(text)) }

    pub fn for_normalized(model_id: &str, normalized: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Self { model_id: model_id.to_string(), digest: hasher.finalize().into() }
    }

    pub fn model_id(&self) -> &str { &self.model_id }
    pub fn digest(&self) -> &[u8; 32] { &self.digest }
    pub fn digest_hex(&self) -> String { hex::encode(self.digest) }
}
