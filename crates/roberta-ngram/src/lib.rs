//! # RoBERTa N-gram
//!
//! Masked-language-model pretraining for RoBERTa-style encoders with an
//! auxiliary N-gram stream.
//!
//! - **Encoder**: pre/post-norm transformer layers with N-gram fusion
//! - **Checkpointing**: chunked recomputation during the reverse pass
//! - **Sparse MLM head**: vocabulary projection on masked rows only
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use roberta_ngram::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let built = ModelBuilder::new()
//!         .config_path("config.json")
//!         .build_masked_lm()?;
//!
//!     let out = built.model.forward_payload(&payload, false, &ForwardCtx::train(0))?;
//!     let loss = out.loss.expect("labelled batch");
//!     let grads = built.model.backward(&loss, &built.params.all_vars())?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use roberta_ngram_core::*;

mod builder;

pub use builder::{BuiltModel, ModelBuilder};

/// Commonly used types.
pub mod prelude {
    pub use crate::builder::{BuiltModel, ModelBuilder};
    pub use roberta_ngram_core::prelude::*;

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
