//! Model configuration.

use super::{ActivationKind, NormKind, NormPlacement};
use crate::error::{Result, RobertaError};
use serde::{Deserialize, Serialize};

/// Configuration for a RoBERTa-style encoder with an optional N-gram stream.
///
/// Keys follow the HuggingFace `config.json` naming so that existing
/// configuration files deserialize without renaming. Kind-valued fields are
/// kept as strings and resolved once, when a component is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Number of main encoder layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Intermediate dimension (feed-forward).
    pub intermediate_size: usize,
    /// Activation name: `gelu`, `relu`, `swish` or `tanh`.
    pub hidden_act: String,
    /// Dropout on hidden states.
    pub hidden_dropout_prob: f64,
    /// Dropout on attention probabilities.
    pub attention_probs_dropout_prob: f64,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// Segment vocabulary size.
    pub type_vocab_size: usize,
    /// Standard deviation of the normal weight initialization.
    pub initializer_range: f64,
    /// Epsilon of the N-gram embedding normalization.
    pub layer_norm_eps: f64,
    /// Padding token id.
    pub pad_token_id: u32,
    /// Normalization kind: `pytorch`, `apex` or `rms_norm`.
    pub layer_norm_type: String,
    /// Normalization placement: `pre-ln` or `post-ln`.
    pub encoder_ln_mode: String,
    /// Global normalization switch.
    #[serde(alias = "useLN")]
    pub use_ln: bool,
    /// Normalize the main embeddings before the first layer.
    pub layernorm_embedding: bool,
    /// Partial fraction for RMS normalization (outside [0, 1] = full axis).
    pub rms_norm_partial: f64,
    /// Learned shift for RMS normalization.
    pub rms_norm_bias: bool,
    /// Use fused bias+activation dense layers.
    pub fused_linear_layer: bool,
    /// Evaluate the MLM head on masked rows only.
    pub sparse_mask_prediction: bool,
    /// Enable the auxiliary N-gram stream.
    #[serde(alias = "is_Ngram")]
    pub is_ngram: bool,
    /// N-gram vocabulary size.
    #[serde(alias = "Ngram_size")]
    pub ngram_vocab_size: usize,
    /// Number of N-gram layers fused into the main stream.
    #[serde(alias = "num_hidden_Ngram_layers")]
    pub num_hidden_ngram_layers: usize,
    /// Output width of the sequence classification head.
    pub num_labels: usize,
    /// Run the encoder as recomputation-checkpointed chunks.
    pub checkpoint_activations: bool,
    /// Substitute main layers with provider-built fused kernels.
    pub fused_transformer_kernel: bool,
}

/// Epsilon used by layer, encoder and head normalizations.
pub const NORM_EPS: f64 = 1e-12;

impl ModelConfig {
    /// Per-head width.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Parsed activation kind.
    pub fn activation(&self) -> Result<ActivationKind> {
        self.hidden_act.parse()
    }

    /// Parsed normalization kind.
    pub fn norm_kind(&self) -> Result<NormKind> {
        self.layer_norm_type.parse()
    }

    /// Parsed normalization placement.
    pub fn norm_placement(&self) -> Result<NormPlacement> {
        self.encoder_ln_mode.parse()
    }

    /// Check construction-time invariants.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(RobertaError::Config(format!(
                "the hidden size ({}) is not a multiple of the number of attention heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        self.activation()?;
        self.norm_kind()?;
        self.norm_placement()?;

        if self.num_labels == 0 {
            return Err(RobertaError::Config("num_labels must be at least 1".into()));
        }
        if self.is_ngram && self.num_hidden_ngram_layers > self.num_hidden_layers {
            return Err(RobertaError::Config(format!(
                "num_hidden_ngram_layers ({}) exceeds num_hidden_layers ({})",
                self.num_hidden_ngram_layers, self.num_hidden_layers
            )));
        }
        if (0.0..=1.0).contains(&self.rms_norm_partial)
            && (self.hidden_size as f64 * self.rms_norm_partial) as usize == 0
        {
            return Err(RobertaError::Config(format!(
                "rms_norm_partial {} selects no channels of {}",
                self.rms_norm_partial, self.hidden_size
            )));
        }
        Ok(())
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// A tiny configuration for tests and demos.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 32,
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            intermediate_size: 32,
            max_position_embeddings: 16,
            ngram_vocab_size: 24,
            ..Default::default()
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        // roberta-base-like defaults
        Self {
            vocab_size: 50265,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: "gelu".to_string(),
            hidden_dropout_prob: 0.1,
            attention_probs_dropout_prob: 0.1,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            initializer_range: 0.02,
            layer_norm_eps: 1e-12,
            pad_token_id: 1,
            layer_norm_type: "pytorch".to_string(),
            encoder_ln_mode: "pre-ln".to_string(),
            use_ln: true,
            layernorm_embedding: false,
            rms_norm_partial: -1.0,
            rms_norm_bias: false,
            fused_linear_layer: true,
            sparse_mask_prediction: true,
            is_ngram: false,
            ngram_vocab_size: 21128,
            num_hidden_ngram_layers: 1,
            num_labels: 2,
            checkpoint_activations: false,
            fused_transformer_kernel: false,
        }
    }
}
