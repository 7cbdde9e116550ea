//! Additive attention bias from a padding mask.

use crate::error::Result;
use candle_core::{DType, Tensor};

/// Bias added to the raw scores of masked positions.
pub const MASKED_POSITION_BIAS: f64 = -10000.0;

/// Build the additive attention bias from a 0/1 padding mask.
///
/// Input: `[batch, seq]`, 1 for positions to attend, 0 for padding.
/// Output: `[batch, 1, 1, seq]` with 0.0 where attendable and `-10000.0`
/// where masked, broadcastable to `[batch, heads, seq, seq]`.
pub fn attention_bias(padding_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let mask = padding_mask.to_dtype(dtype)?.unsqueeze(1)?.unsqueeze(2)?;
    // (1 - m) * -10000 == m * 10000 - 10000
    Ok(mask.affine(-MASKED_POSITION_BIAS, MASKED_POSITION_BIAS)?)
}

/// Attention bias for `ids`, treating every position as attendable when no
/// padding mask is given.
pub fn attention_bias_or_default(
    padding_mask: Option<&Tensor>,
    ids: &Tensor,
    dtype: DType,
) -> Result<Tensor> {
    match padding_mask {
        Some(mask) => attention_bias(mask, dtype),
        None => attention_bias(&ids.ones_like()?, dtype),
    }
}
