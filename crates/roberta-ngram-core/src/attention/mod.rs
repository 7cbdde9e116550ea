//! Self-attention and attention masking.
//!
//! Provides:
//! - [`SelfAttention`] - scaled dot-product attention with self-output projection
//! - [`attention_bias`] - additive bias from a 0/1 padding mask

mod mask;
mod self_attention;

pub use mask::{attention_bias, attention_bias_or_default, MASKED_POSITION_BIAS};
pub use self_attention::SelfAttention;
