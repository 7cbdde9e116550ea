//! Pooler and prediction heads.
//!
//! This module provides:
//! - [`Pooler`] - First-token dense + tanh sentence representation
//! - [`PredictionHeadTransform`] - Dense + activation (+ norm) before decoding
//! - [`LmPredictionHead`] - Vocabulary decoder tied to the token table
//! - [`NspHead`] - Two-way sentence-pair classifier

mod pooler;
mod prediction;

pub use pooler::Pooler;
pub use prediction::{LmPredictionHead, NspHead, PredictionHeadTransform, PredictionMode};
