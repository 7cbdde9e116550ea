//! Parameter storage and weight initialization.

use crate::error::Result;
use crate::model::{zero_row, ModelConfig, NGRAM_TOKEN_TABLE};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::sync::PoisonError;
use tracing::debug;

/// How a parameter is initialized, decided from its name.
#[derive(Debug, Clone, Copy, PartialEq)]
enum InitRule {
    /// Normal(0, std): embedding tables and dense weights.
    Normal(f64),
    /// Zeros: dense biases and norm offsets.
    Zeros,
    /// Ones: norm scales.
    Ones,
}

impl InitRule {
    fn for_name(name: &str, std: f64) -> Self {
        if name.ends_with(".scale") || name == "scale" {
            Self::Ones
        } else if name.ends_with("bias") || name.ends_with("offset") {
            Self::Zeros
        } else {
            Self::Normal(std)
        }
    }

    fn tensor(self, var: &Var) -> Result<Tensor> {
        let t = match self {
            Self::Normal(std) => Tensor::randn(0f64, std, var.dims(), var.device())?,
            Self::Zeros => Tensor::zeros(var.dims(), DType::F64, var.device())?,
            Self::Ones => Tensor::ones(var.dims(), DType::F64, var.device())?,
        };
        Ok(t.to_dtype(var.dtype())?)
    }
}

/// Shared parameter container for one model.
///
/// Every component registers its parameters through [`Self::var_builder`];
/// the training driver reads them back with [`Self::all_vars`].
#[derive(Clone)]
pub struct ParameterStore {
    varmap: VarMap,
    device: Device,
    dtype: DType,
}

impl ParameterStore {
    /// Empty store on `device` with `F32` parameters.
    pub fn new(device: Device) -> Self {
        Self::with_dtype(device, DType::F32)
    }

    /// Empty store with an explicit parameter dtype.
    pub fn with_dtype(device: Device, dtype: DType) -> Self {
        Self {
            varmap: VarMap::new(),
            device,
            dtype,
        }
    }

    /// Builder registering parameters in this store.
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, self.dtype, &self.device)
    }

    /// Every registered parameter.
    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Parameter by full name.
    pub fn get(&self, name: &str) -> Option<Var> {
        self.varmap
            .data()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Number of parameter tensors.
    pub fn len(&self) -> usize {
        self.varmap
            .data()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is registered yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Underlying var map.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Initialize every registered parameter in place.
    ///
    /// Weights and embedding tables are drawn from
    /// `Normal(0, initializer_range)`, biases and norm offsets are zeroed,
    /// norm scales are set to one, and the padding row of the N-gram token
    /// table is zeroed. Tied parameters are initialized once, through their
    /// single owner.
    pub fn init_weights(&self, config: &ModelConfig) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (name, var) in data.iter() {
            let rule = InitRule::for_name(name, config.initializer_range);
            let mut value = rule.tensor(var)?;
            if name.ends_with(NGRAM_TOKEN_TABLE) {
                value = zero_row(&value, config.pad_token_id as usize)?;
            }
            var.set(&value)?;
        }
        debug!(params = data.len(), "initialized weights");
        Ok(())
    }
}

impl std::fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterStore")
            .field("params", &self.len())
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .finish()
    }
}
