//! Model construction.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use roberta_ngram_core::{
    kernel::KernelProvider,
    model::ModelConfig,
    params::ParameterStore,
    tasks::{RobertaForMaskedLm, RobertaForPreTraining, RobertaForSequenceClassification},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// A constructed model with its parameters and configuration.
#[derive(Debug)]
pub struct BuiltModel<M> {
    /// The task model.
    pub model: M,
    /// Parameters registered by the model.
    pub params: ParameterStore,
    /// Resolved configuration.
    pub config: ModelConfig,
}

/// Builder for task models.
pub struct ModelBuilder {
    config_path: Option<PathBuf>,
    model_config: Option<ModelConfig>,
    device: Device,
    dtype: DType,
    kernels: Option<Arc<dyn KernelProvider>>,
    init_weights: bool,
}

impl ModelBuilder {
    /// Create a new model builder.
    pub fn new() -> Self {
        Self {
            config_path: None,
            model_config: None,
            device: Device::Cpu,
            dtype: DType::F32,
            kernels: None,
            init_weights: true,
        }
    }

    /// Read the configuration from a JSON file.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Set model configuration directly; takes precedence over a path.
    pub fn model_config(mut self, config: ModelConfig) -> Self {
        self.model_config = Some(config);
        self
    }

    /// Set the device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Set the parameter dtype.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Install a fused kernel provider.
    pub fn kernel_provider(mut self, provider: Arc<dyn KernelProvider>) -> Self {
        self.kernels = Some(provider);
        self
    }

    /// Keep the construction-time parameter values instead of running
    /// weight initialization.
    pub fn skip_init(mut self) -> Self {
        self.init_weights = false;
        self
    }

    fn resolve_config(&self) -> Result<ModelConfig> {
        let config = match (&self.model_config, &self.config_path) {
            (Some(config), _) => config.clone(),
            (None, Some(path)) => ModelConfig::from_file(path)
                .with_context(|| format!("loading model config from {}", path.display()))?,
            (None, None) => ModelConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn build<M>(
        &self,
        variant: &str,
        ctor: impl FnOnce(
            &ModelConfig,
            candle_nn::VarBuilder<'static>,
            Option<&dyn KernelProvider>,
        ) -> roberta_ngram_core::Result<M>,
    ) -> Result<BuiltModel<M>> {
        let config = self.resolve_config()?;
        let params = ParameterStore::with_dtype(self.device.clone(), self.dtype);
        let model = ctor(&config, params.var_builder(), self.kernels.as_deref())
            .with_context(|| format!("building {variant} model"))?;
        if self.init_weights {
            params.init_weights(&config)?;
        }
        info!(
            variant,
            params = params.len(),
            hidden = config.hidden_size,
            "model ready"
        );
        Ok(BuiltModel {
            model,
            params,
            config,
        })
    }

    /// Build the joint masked-LM + next-sentence model.
    pub fn build_pretraining(&self) -> Result<BuiltModel<RobertaForPreTraining>> {
        self.build("pretraining", RobertaForPreTraining::new)
    }

    /// Build the masked-LM model.
    pub fn build_masked_lm(&self) -> Result<BuiltModel<RobertaForMaskedLm>> {
        self.build("masked LM", RobertaForMaskedLm::new)
    }

    /// Build the sequence classification model.
    pub fn build_classification(&self) -> Result<BuiltModel<RobertaForSequenceClassification>> {
        self.build("classification", RobertaForSequenceClassification::new)
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBuilder")
            .field("config_path", &self.config_path)
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("kernels", &self.kernels.as_ref().map(|k| k.name().to_string()))
            .field("init_weights", &self.init_weights)
            .finish()
    }
}
