//! # RoBERTa N-gram Core
//!
//! Forward core of a RoBERTa-style masked-language-model encoder with an
//! auxiliary N-gram stream fused into the main hidden states.
//!
//! This crate provides:
//! - **Primitives**: fused bias+activation, standard and RMS normalization
//! - **Encoder stack** with pre/post-norm layers, N-gram fusion and
//!   recomputation checkpointing
//! - **Heads**: pooler, tied masked-LM decoder with sparse evaluation,
//!   next-sentence classifier
//! - **Task variants** for pretraining, masked-LM and sequence
//!   classification, plus weight initialization

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod attention;
pub mod encoder;
pub mod error;
pub mod heads;
pub mod kernel;
pub mod model;
pub mod params;
pub mod tasks;

pub use error::{Result, RobertaError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::encoder::{Encoder, EncoderOptions, EncoderOutput};
    pub use crate::error::{Result, RobertaError};
    pub use crate::kernel::KernelProvider;
    pub use crate::model::{ForwardCtx, ModelConfig, ModelInputs, NgramBatch, RobertaModel};
    pub use crate::params::ParameterStore;
    pub use crate::tasks::{
        ClassificationBatch, MaskedLmBatch, PretrainingBatch, RobertaForMaskedLm,
        RobertaForPreTraining, RobertaForSequenceClassification,
    };
}
