use anyhow::{Result, ensure};
use candle_core::{DType, Tensor};

/// Average the token states selected by `mask`, then scale each row to unit length.
///
/// `hidden` is `[B, T, H]` and `mask` is `[B, T]`; the result is `[B, H]`.
pub fn mean_pool_normalized(hidden: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (batch, _tokens, width) = hidden.dims3()?;
    let weights = mask.to_device(hidden.device())?.to_dtype(hidden.dtype())?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&weights)?.sum(1)?;
    // Rows with an all-zero mask pool to zero instead of NaN.
    let counts = weights.sum(1)?.clamp(1f64, f64::MAX)?;
    let mean = summed.broadcast_div(&counts)?;

    let floor = if hidden.dtype() == DType::F16 { 1e-6 } else { 1e-12 };
    let norms = mean.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(floor, f64::MAX)?;
    let pooled = mean.broadcast_div(&norms)?;
    ensure!(pooled.dims() == [batch, width], "pooled shape {:?}, expected [{batch}, {width}]", pooled.dims());
    Ok(pooled)
}

