//! Feed-forward block.
//!
//! `FFN(x) = dropout(act(x @ W_in^T + b_in) @ W_out^T + b_out)`
//!
//! The intermediate projection goes through [`DenseActivation`], so the
//! fused bias+activation path applies when `fused_linear_layer` is set.

use super::{linear, DenseActivation, Dropout, ForwardCtx, ModelConfig};
use crate::error::Result;
use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

/// Intermediate projection with activation, then output projection.
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// Hidden -> intermediate, activated.
    intermediate: DenseActivation,
    /// Intermediate -> hidden.
    output: Linear,
    /// Dropout on the output projection.
    dropout: Dropout,
    /// Hidden dimension.
    hidden_size: usize,
    /// Intermediate dimension.
    intermediate_size: usize,
}

impl FeedForward {
    /// Create with parameters under `vb` (`intermediate.dense`, `output.dense`).
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let intermediate_size = config.intermediate_size;

        let intermediate = DenseActivation::new(
            hidden_size,
            intermediate_size,
            config.activation()?,
            config.fused_linear_layer,
            config.initializer_range,
            vb.pp("intermediate").pp("dense"),
        )?;
        let output = linear(
            intermediate_size,
            hidden_size,
            config.initializer_range,
            vb.pp("output").pp("dense"),
        )?;

        Ok(Self {
            intermediate,
            output,
            dropout: Dropout::new(config.hidden_dropout_prob),
            hidden_size,
            intermediate_size,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor, ctx: &ForwardCtx) -> Result<Tensor> {
        let activated = self.intermediate.forward(x)?;
        let output = self.output.forward(&activated)?;
        self.dropout.forward(&output, ctx)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }
}
