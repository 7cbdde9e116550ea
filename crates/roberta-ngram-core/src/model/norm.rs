//! Normalization strategies.
//!
//! A [`Norm`] is resolved once from the configured kind and keeps that
//! strategy for its whole lifetime:
//! - [`StandardNorm`] - mean/variance normalization with scale and shift
//! - [`RmsNorm`] - root-mean-square normalization without centering
//! - fused standard normalization (`fused-kernels` feature only)

use super::{ModelConfig, RmsNorm};
use crate::error::{Result, RobertaError};
use candle_core::{DType, Tensor, D};
use candle_nn::{Init, VarBuilder};
use std::str::FromStr;

/// Configured normalization kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// Mean/variance normalization (`pytorch`).
    Standard,
    /// Fused mean/variance normalization (`apex`).
    FusedStandard,
    /// Root-mean-square normalization (`rms_norm`).
    Rms,
}

impl FromStr for NormKind {
    type Err = RobertaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pytorch" => Ok(Self::Standard),
            "apex" => Ok(Self::FusedStandard),
            "rms_norm" => Ok(Self::Rms),
            other => Err(RobertaError::UnknownNormKind(other.to_string())),
        }
    }
}

/// Where a sub-block normalizes relative to its residual addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormPlacement {
    /// Normalize the sub-block input.
    Pre,
    /// Normalize after the residual add.
    Post,
}

impl FromStr for NormPlacement {
    type Err = RobertaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pre-ln" => Ok(Self::Pre),
            "post-ln" => Ok(Self::Post),
            other => Err(RobertaError::UnknownNormPlacement(other.to_string())),
        }
    }
}

/// Per-last-axis mean/variance normalization.
///
/// `y = (x - mean) / sqrt(var + eps) * scale + offset`
#[derive(Debug, Clone)]
pub struct StandardNorm {
    scale: Tensor,
    offset: Tensor,
    eps: f64,
}

impl StandardNorm {
    /// Create with `scale`/`offset` parameters under `vb`.
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let scale = vb.get_with_hints(dim, "scale", Init::Const(1.0))?;
        let offset = vb.get_with_hints(dim, "offset", Init::Const(0.0))?;
        Ok(Self { scale, offset, eps })
    }

    /// Forward pass over `[..., dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        let out = normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.scale)?
            .broadcast_add(&self.offset)?;
        Ok(out)
    }

    /// Scale parameter.
    pub fn scale(&self) -> &Tensor {
        &self.scale
    }
}

#[derive(Debug, Clone)]
enum Strategy {
    Standard(StandardNorm),
    #[cfg(feature = "fused-kernels")]
    FusedStandard(StandardNorm),
    Rms(RmsNorm),
}

/// A normalization layer with its strategy fixed at construction.
#[derive(Debug, Clone)]
pub struct Norm {
    strategy: Strategy,
}

impl Norm {
    /// Build the configured normalization kind with epsilon `eps`.
    pub fn from_config(config: &ModelConfig, eps: f64, vb: VarBuilder) -> Result<Self> {
        Self::new(config.norm_kind()?, config, eps, vb)
    }

    /// Build a specific normalization kind.
    pub fn new(kind: NormKind, config: &ModelConfig, eps: f64, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_size;
        let strategy = match kind {
            NormKind::Standard => Strategy::Standard(StandardNorm::new(dim, eps, vb)?),
            NormKind::FusedStandard => Self::fused_standard(dim, eps, vb)?,
            NormKind::Rms => Strategy::Rms(RmsNorm::new(
                dim,
                config.rms_norm_partial,
                eps,
                config.rms_norm_bias,
                vb,
            )?),
        };
        Ok(Self { strategy })
    }

    /// Standard normalization regardless of the configured kind.
    pub fn standard(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            strategy: Strategy::Standard(StandardNorm::new(dim, eps, vb)?),
        })
    }

    #[cfg(feature = "fused-kernels")]
    fn fused_standard(dim: usize, eps: f64, vb: VarBuilder) -> Result<Strategy> {
        Ok(Strategy::FusedStandard(StandardNorm::new(dim, eps, vb)?))
    }

    #[cfg(not(feature = "fused-kernels"))]
    fn fused_standard(_dim: usize, _eps: f64, _vb: VarBuilder) -> Result<Strategy> {
        Err(RobertaError::MissingCapability(
            "layer norm of type apex needs fused normalization kernels; \
             rebuild with the `fused-kernels` feature"
                .to_string(),
        ))
    }

    /// Apply the normalization.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.strategy {
            Strategy::Standard(norm) => norm.forward(x),
            #[cfg(feature = "fused-kernels")]
            Strategy::FusedStandard(norm) => {
                // `ops::layer_norm` has no backward pass; this one keeps the graph.
                let x = x.contiguous()?;
                Ok(candle_nn::ops::layer_norm_slow(
                    &x,
                    &norm.scale,
                    &norm.offset,
                    norm.eps as f32,
                )?)
            }
            Strategy::Rms(norm) => norm.forward(x),
        }
    }

    /// Resolved kind.
    pub fn kind(&self) -> NormKind {
        match &self.strategy {
            Strategy::Standard(_) => NormKind::Standard,
            #[cfg(feature = "fused-kernels")]
            Strategy::FusedStandard(_) => NormKind::FusedStandard,
            Strategy::Rms(_) => NormKind::Rms,
        }
    }
}
