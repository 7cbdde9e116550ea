//! Sentence-level pooling.

use crate::error::Result;
use crate::model::{ActivationKind, DenseActivation, ModelConfig};
use candle_core::{IndexOp, Tensor};
use candle_nn::VarBuilder;

/// Dense + tanh over the first token of every sequence.
#[derive(Debug, Clone)]
pub struct Pooler {
    dense: DenseActivation,
    span: tracing::Span,
}

impl Pooler {
    /// Create with parameters under `vb` (`dense`).
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dense = DenseActivation::new(
            config.hidden_size,
            config.hidden_size,
            ActivationKind::Tanh,
            config.fused_linear_layer,
            config.initializer_range,
            vb.pp("dense"),
        )?;
        Ok(Self {
            dense,
            span: tracing::span!(tracing::Level::TRACE, "pooler"),
        })
    }

    /// `[batch, seq, hidden]` -> `[batch, hidden]`
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let first = hidden_states.i((.., 0))?;
        self.dense.forward(&first)
    }
}
