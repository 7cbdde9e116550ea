//! Task variants wrapping the shared encoder.
//!
//! This module provides:
//! - [`RobertaForPreTraining`] - Masked-LM + next-sentence pretraining
//! - [`RobertaForMaskedLm`] - Masked-LM only, with optional N-gram fusion
//! - [`RobertaForSequenceClassification`] - Classification or regression
//! - Ordered batch payloads and loss helpers

mod batch;
mod classification;
mod loss;
mod masked_lm;
mod pretraining;

pub use batch::{ClassificationBatch, MaskedLmBatch, PretrainingBatch};
pub use classification::{RobertaForSequenceClassification, SequenceClassifierOutput};
pub use loss::{
    cross_entropy_ignoring, gather_labels, masked_token_indexes, LossKind, IGNORE_INDEX,
};
pub use masked_lm::{MaskedLmOutput, RobertaForMaskedLm};
pub use pretraining::{PretrainingOutput, RobertaForPreTraining};
