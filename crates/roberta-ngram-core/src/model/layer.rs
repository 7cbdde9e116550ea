//! Transformer layer implementation.
//!
//! A single encoder layer combining:
//! - Self-attention sub-block with residual
//! - Feed-forward sub-block with residual
//! - Pre- or post-residual normalization per sub-block

use super::{FeedForward, ForwardCtx, ModelConfig, Norm, NormPlacement, NORM_EPS};
use crate::attention::SelfAttention;
use crate::error::Result;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use std::fmt;

/// Output of one encoder layer.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    /// Hidden state [batch, seq, hidden].
    pub hidden_states: Tensor,
    /// Attention probabilities [batch, heads, seq, seq], if computed.
    pub attention_probs: Option<Tensor>,
}

/// The capability every encoder layer provides: map a hidden state and an
/// attention bias to a new hidden state.
pub trait EncoderLayer: fmt::Debug + Send + Sync {
    /// Run the layer.
    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        ctx: &ForwardCtx,
    ) -> Result<LayerOutput>;
}

/// Whether a layer runs or is bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerAction {
    /// Run attention and feed-forward.
    #[default]
    Apply,
    /// Skip both sub-blocks and return the input unchanged.
    Skip,
}

/// A single transformer encoder layer.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    /// Self-attention.
    attention: SelfAttention,
    /// Norm before attention (pre-norm) or after its residual (post-norm).
    pre_attention_norm: Option<Norm>,
    /// Norm before the feed-forward (pre-norm) or after its residual (post-norm).
    post_attention_norm: Option<Norm>,
    /// Feed-forward block.
    mlp: FeedForward,
    /// Placement; `None` when normalization is globally disabled.
    placement: Option<NormPlacement>,
    /// Layer index (for debugging).
    layer_idx: usize,
    span: tracing::Span,
}

impl TransformerLayer {
    /// Create a new transformer layer with parameters under `vb`.
    pub fn new(config: &ModelConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let attention = SelfAttention::new(config, vb.pp("attention"))?;
        let mlp = FeedForward::new(config, vb.clone())?;

        let (placement, pre_attention_norm, post_attention_norm) = if config.use_ln {
            (
                Some(config.norm_placement()?),
                Some(Norm::from_config(config, NORM_EPS, vb.pp("pre_attention_norm"))?),
                Some(Norm::from_config(config, NORM_EPS, vb.pp("post_attention_norm"))?),
            )
        } else {
            (None, None, None)
        };

        Ok(Self {
            attention,
            pre_attention_norm,
            post_attention_norm,
            mlp,
            placement,
            layer_idx,
            span: tracing::span!(tracing::Level::TRACE, "layer", idx = layer_idx),
        })
    }

    fn maybe_norm(&self, x: Tensor, norm: &Option<Norm>, at: NormPlacement) -> Result<Tensor> {
        match (norm, self.placement) {
            (Some(norm), Some(placement)) if placement == at => norm.forward(&x),
            _ => Ok(x),
        }
    }

    /// Forward pass with an explicit action and residual keep probability.
    ///
    /// Sub-block outputs are divided by `keep_prob` before the residual add.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Input tensor [batch, seq_len, hidden_size]
    /// * `attention_bias` - Additive bias broadcastable to [batch, heads, seq, seq]
    /// * `action` - [`LayerAction::Skip`] returns the input unchanged
    /// * `keep_prob` - Residual scaling for stochastic depth (1.0 = none)
    pub fn forward_with(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        action: LayerAction,
        keep_prob: f64,
        ctx: &ForwardCtx,
    ) -> Result<LayerOutput> {
        if action == LayerAction::Skip {
            return Ok(LayerOutput {
                hidden_states: hidden_states.clone(),
                attention_probs: None,
            });
        }
        let _enter = self.span.enter();

        // Attention sub-block
        let attn_input = self.maybe_norm(
            hidden_states.clone(),
            &self.pre_attention_norm,
            NormPlacement::Pre,
        )?;
        let (attn_output, attention_probs) =
            self.attention.forward(&attn_input, attention_bias, ctx)?;
        let attn_output = scale_residual(attn_output, keep_prob)?;
        let intermediate = (hidden_states + attn_output)?;
        let intermediate =
            self.maybe_norm(intermediate, &self.pre_attention_norm, NormPlacement::Post)?;

        // Feed-forward sub-block
        let mlp_input = self.maybe_norm(
            intermediate.clone(),
            &self.post_attention_norm,
            NormPlacement::Pre,
        )?;
        let mlp_output = scale_residual(self.mlp.forward(&mlp_input, ctx)?, keep_prob)?;
        let output = (mlp_output + intermediate)?;
        let output = self.maybe_norm(output, &self.post_attention_norm, NormPlacement::Post)?;

        Ok(LayerOutput {
            hidden_states: output,
            attention_probs: Some(attention_probs),
        })
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &SelfAttention {
        &self.attention
    }

    /// Get the MLP module.
    pub fn mlp(&self) -> &FeedForward {
        &self.mlp
    }
}

impl EncoderLayer for TransformerLayer {
    fn forward(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        ctx: &ForwardCtx,
    ) -> Result<LayerOutput> {
        self.forward_with(hidden_states, attention_bias, LayerAction::Apply, 1.0, ctx)
    }
}

fn scale_residual(x: Tensor, keep_prob: f64) -> Result<Tensor> {
    if keep_prob == 1.0 {
        Ok(x)
    } else {
        Ok((x / keep_prob)?)
    }
}
