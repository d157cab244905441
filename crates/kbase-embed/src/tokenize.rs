use anyhow::{Result, anyhow};
use candle_core::{DType, Device, Tensor};
use tokenizers::Tokenizer;

/// XLM-RoBERTa `<pad>` token id.
pub const PAD_ID: u32 = 1;

/// Model inputs for one batch, each shaped `[batch, width]`.
pub struct EncodedBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub token_type_ids: Tensor,
}

/// Tokenize `texts` together. Rows are padded to the longest encoding in the
/// batch, and no row is wider than `max_len`.
pub fn encode_batch(tokenizer: &Tokenizer, texts: &[String], max_len: usize, device: &Device) -> Result<EncodedBatch> {
    let encodings = tokenizer
        .encode_batch(texts.to_vec(), true)
        .map_err(|e| anyhow!("tokenizing {} texts: {e}", texts.len()))?;
    let width = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0).clamp(1, max_len.max(1));

    let mut ids = Vec::with_capacity(encodings.len() * width);
    let mut mask = Vec::with_capacity(encodings.len() * width);
    for enc in &encodings {
        let used = enc.get_ids().len().min(width);
        ids.extend_from_slice(&enc.get_ids()[..used]);
        mask.extend_from_slice(&enc.get_attention_mask()[..used]);
        ids.resize(ids.len() + width - used, PAD_ID);
        mask.resize(mask.len() + width - used, 0);
    }

    let shape = (encodings.len(), width);
    Ok(EncodedBatch {
        input_ids: Tensor::from_vec(ids, shape, device)?,
        attention_mask: Tensor::from_vec(mask, shape, device)?,
        token_type_ids: Tensor::zeros(shape, DType::U32, device)?,
    })
}
