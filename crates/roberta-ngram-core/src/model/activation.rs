//! Activations and fused dense+activation projections.
//!
//! The fused path adds the bias to the bare `x @ W^T` product inside the
//! activation call instead of going through a biased linear layer first.
//! Only `gelu`, `relu` and `tanh` have a fused form; `swish` always takes
//! the regular path.

use crate::error::{Result, RobertaError};
use candle_core::{Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder};
use std::str::FromStr;

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Exact (erf) GELU.
    Gelu,
    /// Rectified linear unit.
    Relu,
    /// `x * sigmoid(x)`.
    Swish,
    /// Hyperbolic tangent.
    Tanh,
}

impl ActivationKind {
    /// Apply the activation.
    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        let y = match self {
            Self::Gelu => x.gelu_erf()?,
            Self::Relu => x.relu()?,
            Self::Swish => candle_nn::ops::silu(x)?,
            Self::Tanh => x.tanh()?,
        };
        Ok(y)
    }

    /// Whether a fused bias+activation form exists.
    pub fn has_fused_bias(self) -> bool {
        !matches!(self, Self::Swish)
    }
}

impl FromStr for ActivationKind {
    type Err = RobertaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gelu" => Ok(Self::Gelu),
            "relu" => Ok(Self::Relu),
            "swish" | "silu" => Ok(Self::Swish),
            "tanh" => Ok(Self::Tanh),
            other => Err(RobertaError::UnknownActivation(other.to_string())),
        }
    }
}

/// Compute `activation(preactivation + bias)` for a kind with a fused form.
pub fn fused_bias_activation(
    bias: &Tensor,
    preactivation: &Tensor,
    kind: ActivationKind,
) -> Result<Tensor> {
    if !kind.has_fused_bias() {
        return Err(RobertaError::UnknownActivation(format!(
            "{kind:?} has no fused bias form"
        )));
    }
    let x = preactivation.broadcast_add(bias)?;
    kind.apply(&x)
}

/// Biased dense layer with normal-initialized weight and zero bias.
pub fn linear(
    in_features: usize,
    out_features: usize,
    init_std: f64,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_features, in_features),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: init_std,
        },
    )?;
    let bias = vb.get_with_hints(out_features, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

#[derive(Debug, Clone)]
enum BiasPath {
    /// `fused_bias_activation(bias, x @ W^T)`.
    Fused { weight: Linear, bias: Tensor },
    /// `act(x @ W^T + b)`.
    Regular(Linear),
}

/// Dense projection followed by an activation.
///
/// The bias path is chosen once at construction from the
/// `fused_linear_layer` switch and the activation kind.
#[derive(Debug, Clone)]
pub struct DenseActivation {
    path: BiasPath,
    kind: ActivationKind,
}

impl DenseActivation {
    /// Create with weights `weight` [out, in] and `bias` [out] under `vb`.
    pub fn new(
        in_features: usize,
        out_features: usize,
        kind: ActivationKind,
        fused: bool,
        init_std: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let dense = linear(in_features, out_features, init_std, vb)?;
        let path = match dense.bias() {
            Some(bias) if fused && kind.has_fused_bias() => BiasPath::Fused {
                bias: bias.clone(),
                weight: Linear::new(dense.weight().clone(), None),
            },
            _ => BiasPath::Regular(dense),
        };
        Ok(Self { path, kind })
    }

    /// Forward pass over `[..., in_features]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.path {
            BiasPath::Fused { weight, bias } => {
                let pre = weight.forward(x)?;
                fused_bias_activation(bias, &pre, self.kind)
            }
            BiasPath::Regular(linear) => self.kind.apply(&linear.forward(x)?),
        }
    }

    /// Whether the fused bias path was selected.
    pub fn is_fused(&self) -> bool {
        matches!(self.path, BiasPath::Fused { .. })
    }

    /// Activation kind.
    pub fn kind(&self) -> ActivationKind {
        self.kind
    }
}
