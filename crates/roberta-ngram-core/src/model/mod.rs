//! Model building blocks.
//!
//! Provides the pieces the encoder is assembled from:
//! - Model configuration
//! - Activations, normalization and dropout
//! - Embeddings for the main and N-gram streams
//! - Feed-forward block and transformer layer
//! - The base encoder model

mod activation;
mod config;
mod dropout;
mod embedding;
mod layer;
mod mlp;
mod norm;
mod rmsnorm;
mod roberta;

pub use activation::{fused_bias_activation, linear, ActivationKind, DenseActivation};
pub use config::{ModelConfig, NORM_EPS};
pub use dropout::{Dropout, ForwardCtx};
pub(crate) use embedding::zero_row;
pub use embedding::{Embeddings, NgramEmbeddings, NGRAM_TOKEN_TABLE};
pub use layer::{EncoderLayer, LayerAction, LayerOutput, TransformerLayer};
pub use mlp::FeedForward;
pub use norm::{Norm, NormKind, NormPlacement, StandardNorm};
pub use rmsnorm::RmsNorm;
pub use roberta::{ModelInputs, NgramBatch, RobertaModel, RobertaOutput};
