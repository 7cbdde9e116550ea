//! Error types for the encoder core.

use thiserror::Error;

/// Result type alias for encoder operations.
pub type Result<T> = std::result::Result<T, RobertaError>;

/// Errors that can occur while building or running a model.
#[derive(Error, Debug)]
pub enum RobertaError {
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Activation name not in the activation table.
    #[error("unknown activation: {0}")]
    UnknownActivation(String),

    /// Normalization kind not in the normalization table.
    #[error("layer norm of type {0} is not available")]
    UnknownNormKind(String),

    /// Normalization placement mode not recognised.
    #[error("unknown encoder norm mode: {0}")]
    UnknownNormPlacement(String),

    /// An optional fused provider was requested but is not available.
    #[error("missing capability: {0}")]
    MissingCapability(String),

    /// A tensor required by the configured model is absent.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// Ordered batch payload does not match its layout.
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    /// Every label equals the ignore sentinel.
    #[error("no labelled targets in batch")]
    NoTargets,

    /// Forward options that cannot be combined.
    #[error("incompatible options: {0}")]
    IncompatibleOptions(String),

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}
