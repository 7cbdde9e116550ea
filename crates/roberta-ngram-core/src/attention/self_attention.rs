//! Multi-head self-attention with an additive bias.

use crate::error::Result;
use crate::model::{linear, Dropout, ForwardCtx, ModelConfig};
use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

/// Self-attention module: Q/K/V projections, scaled dot-product attention
/// and the self-output projection.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    /// Query projection: [num_heads * head_dim, hidden_size]
    query: Linear,
    /// Key projection: [num_heads * head_dim, hidden_size]
    key: Linear,
    /// Value projection: [num_heads * head_dim, hidden_size]
    value: Linear,
    /// Self-output projection: [hidden_size, num_heads * head_dim]
    output: Linear,
    /// Dropout on attention probabilities.
    probs_dropout: Dropout,
    /// Dropout on the self-output.
    output_dropout: Dropout,
    /// Number of attention heads.
    num_heads: usize,
    /// Head dimension.
    head_dim: usize,
    span: tracing::Span,
}

impl SelfAttention {
    /// Create attention with parameters under `vb`
    /// (`self.{query,key,value}`, `output.dense`).
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let std = config.initializer_range;
        let all_head_size = config.num_attention_heads * config.head_dim();

        let self_vb = vb.pp("self");
        Ok(Self {
            query: linear(hidden, all_head_size, std, self_vb.pp("query"))?,
            key: linear(hidden, all_head_size, std, self_vb.pp("key"))?,
            value: linear(hidden, all_head_size, std, self_vb.pp("value"))?,
            output: linear(all_head_size, hidden, std, vb.pp("output").pp("dense"))?,
            probs_dropout: Dropout::new(config.attention_probs_dropout_prob),
            output_dropout: Dropout::new(config.hidden_dropout_prob),
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
            span: tracing::span!(tracing::Level::TRACE, "self-attn"),
        })
    }

    /// `[batch, seq, heads * head_dim]` -> `[batch, heads, seq, head_dim]`
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        Ok(x
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Scaled dot-product attention.
    ///
    /// Returns the context `[batch, seq, heads * head_dim]` and the attention
    /// probabilities `[batch, heads, seq, seq]`.
    pub fn context(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        ctx: &ForwardCtx,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, _) = hidden_states.dims3()?;

        let q = self.split_heads(&self.query.forward(hidden_states)?)?;
        let k = self.split_heads(&self.key.forward(hidden_states)?)?;
        let v = self.split_heads(&self.value.forward(hidden_states)?)?;

        // Q @ K^T / sqrt(d)
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(attention_bias)?;

        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        // Drops whole attention weights, not elements of the values.
        let dropped = self.probs_dropout.forward(&probs, ctx)?;

        let context = dropped
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        Ok((context, probs))
    }

    /// Attention followed by the self-output projection and dropout.
    ///
    /// No normalization or residual is applied here; the transformer layer
    /// owns both.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        ctx: &ForwardCtx,
    ) -> Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let (context, probs) = self.context(hidden_states, attention_bias, ctx)?;
        let out = self.output.forward(&context)?;
        let out = self.output_dropout.forward(&out, ctx)?;
        Ok((out, probs))
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}
