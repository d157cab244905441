//! Local embedding providers.
//!
//! `BgeM3Embedder` runs the BGE-M3 XLM-RoBERTa encoder through candle;
//! `HashEmbedder` produces deterministic hashed bag-of-words vectors for
//! development and tests. Both implement [`EmbeddingProvider`].

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::xlm_roberta::{Config as XLMRobertaConfig, XLMRobertaModel};
use tokenizers::Tokenizer;
use twox_hash::XxHash64;

use kbase_core::config::{EmbeddingSettings, ProviderKind};
use kbase_core::{EmbedError, EmbeddingProvider, Error};

pub mod device;
pub mod pool;
pub mod tokenize;

pub use device::select_device;
pub use pool::mean_pool_normalized;
pub use tokenize::{EncodedBatch, encode_batch};

const BGE_M3_DIM: usize = 1024;
const BGE_M3_MAX_LEN: usize = 256;
/// Texts per forward pass.
const BGE_M3_BATCH: usize = 16;

/// The BGE-M3 encoder with its tokenizer, loaded from local files.
pub struct EmbeddingModel { model: XLMRobertaModel, tokenizer: Tokenizer, device: Device }

impl EmbeddingModel {
    /// Expects `tokenizer.json`, `config.json` and `pytorch_model.bin` in `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self> {
        let device = select_device();
        tracing::info!(dir = %model_dir.display(), "loading BGE-M3 model");
        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| anyhow!("reading tokenizer in {}: {e}", model_dir.display()))?;
        let config: XLMRobertaConfig = serde_json::from_str(&std::fs::read_to_string(model_dir.join("config.json"))?)?;
        let tensors: HashMap<String, Tensor> = candle_core::pickle::read_all(model_dir.join("pytorch_model.bin"))?.into_iter().collect();
        let model = XLMRobertaModel::new(&config, VarBuilder::from_tensors(tensors, DType::F32, &device))?;
        tracing::info!(dim = BGE_M3_DIM, "BGE-M3 model loaded");
        Ok(Self { model, tokenizer, device })
    }

    /// Embed texts in forward passes of up to `BGE_M3_BATCH` rows.
    pub fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let mut out = Vec::with_capacity(texts.len());
        for group in texts.chunks(BGE_M3_BATCH) {
            let batch = encode_batch(&self.tokenizer, group, BGE_M3_MAX_LEN, &self.device)?;
            let hidden = self.model.forward(&batch.input_ids, &batch.attention_mask, &batch.token_type_ids, None, None, None)?;
            let pooled = mean_pool_normalized(&hidden, &batch.attention_mask)?;
            out.extend(pooled.to_device(&Device::Cpu)?.to_vec2::<f32>()?);
        }
        if let Some(bad) = out.iter().find(|v| v.len() != BGE_M3_DIM) {
            return Err(anyhow!("expected {BGE_M3_DIM} dims, got {}", bad.len()));
        }
        tracing::debug!(texts = texts.len(), ms = start.elapsed().as_millis() as u64, "embedded batch");
        Ok(out)
    }
}

/// [`EmbeddingProvider`] over a shared [`EmbeddingModel`]; inference runs on the blocking pool.
pub struct BgeM3Embedder { model: Arc<EmbeddingModel>, id: String }

impl BgeM3Embedder {
    pub fn new(model_dir: &Path) -> Result<Self> {
        let model = EmbeddingModel::load(model_dir)?;
        Ok(Self { model: Arc::new(model), id: format!("bge-m3:d{}", BGE_M3_DIM) })
    }
}

#[async_trait]
impl EmbeddingProvider for BgeM3Embedder {
    fn model_id(&self) -> &str { &self.id }
    fn dim(&self) -> usize { BGE_M3_DIM }

    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
        if let Some(i) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(EmbedError::InvalidInput(format!("text #{i} is empty")));
        }
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || model.embed_texts(&texts))
            .await
            .map_err(|e| EmbedError::Unavailable(format!("embedding task failed: {e}")))?
            .map_err(|e| EmbedError::Unavailable(e.to_string()))
    }
}

/// Deterministic hashed bag-of-words embedder.
///
/// Each lowercase token is hashed into one of `dim` buckets; the result is
/// L2-normalized, so texts sharing tokens have positive cosine similarity.
pub struct HashEmbedder { dim: usize, id: String }

impl HashEmbedder {
    pub fn new(dim: usize) -> Self { Self { dim, id: format!("hash-xx64:d{dim}") } }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let mut hasher = XxHash64::with_seed(0);
            token.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dim as u64) as usize;
            v[idx] += 1.0 + ((h >> 32) as u32 as f32 / u32::MAX as f32) * 0.1;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        for x in &mut v { *x /= norm; }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_id(&self) -> &str { &self.id }
    fn dim(&self) -> usize { self.dim }

    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> {
        if let Some(i) = texts.iter().position(|t| !t.chars().any(char::is_alphanumeric)) {
            return Err(EmbedError::InvalidInput(format!("text #{i} has no tokens")));
        }
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Wraps a provider to report a configured model identity.
struct Renamed { inner: Arc<dyn EmbeddingProvider>, id: String }

#[async_trait]
impl EmbeddingProvider for Renamed {
    fn model_id(&self) -> &str { &self.id }
    fn dim(&self) -> usize { self.inner.dim() }
    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbedError> { self.inner.embed_batch(texts).await }
}

/// Build the provider selected by `embedding.provider`.
pub fn provider_from_settings(settings: &EmbeddingSettings) -> kbase_core::Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match settings.provider {
        ProviderKind::Hash => Arc::new(HashEmbedder::new(settings.dim)),
        ProviderKind::BgeM3 => {
            if settings.dim != BGE_M3_DIM {
                return Err(Error::Configuration(format!("bge-m3 produces {} dims but embedding.dim = {}", BGE_M3_DIM, settings.dim)));
            }
            let dir = resolve_model_dir(settings.model_dir.as_deref())?;
            Arc::new(BgeM3Embedder::new(&dir).map_err(|e| Error::Configuration(format!("cannot load bge-m3: {e:#}")))?)
        }
    };
    Ok(match &settings.model_id {
        Some(id) if id != provider.model_id() => Arc::new(Renamed { inner: provider, id: id.clone() }),
        _ => provider,
    })
}

fn resolve_model_dir(configured: Option<&Path>) -> kbase_core::Result<PathBuf> {
    if let Some(p) = configured {
        if p.exists() { return Ok(p.to_path_buf()); }
        return Err(Error::Configuration(format!("embedding.model_dir {} does not exist", p.display())));
    }
    if let Ok(dir) = std::env::var("MODEL_DIR") { let p = PathBuf::from(&dir); if p.exists() { return Ok(p); } }
    let local = Path::new("models/bge-m3"); if local.exists() { return Ok(local.to_path_buf()); }
    Err(Error::Configuration("Could not locate BGE-M3 model directory; set embedding.model_dir".into()))
}
