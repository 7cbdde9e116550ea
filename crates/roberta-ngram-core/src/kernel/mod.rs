//! Pluggable transformer-layer kernels.
//!
//! This module provides:
//! - [`KernelProvider`] - Trait for providers that substitute every main
//!   encoder layer with their own implementation
//! - [`ReferenceKernels`] - Provider building the default layer, for testing
//!   the substitution path

use crate::error::Result;
use crate::model::{EncoderLayer, ModelConfig, TransformerLayer};
use candle_nn::VarBuilder;
use std::fmt;

/// Builds replacement encoder layers.
///
/// Each layer is built under its own parameter prefix, so a substituted
/// stack never shares parameters with the default layers.
pub trait KernelProvider: Send + Sync + fmt::Debug {
    /// Provider name, used in logs.
    fn name(&self) -> &str;

    /// Build layer `layer_idx` with parameters under `vb`.
    fn build_layer(
        &self,
        config: &ModelConfig,
        layer_idx: usize,
        vb: VarBuilder,
    ) -> Result<Box<dyn EncoderLayer>>;
}

/// Provider that builds the default [`TransformerLayer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernels;

impl KernelProvider for ReferenceKernels {
    fn name(&self) -> &str {
        "reference"
    }

    fn build_layer(
        &self,
        config: &ModelConfig,
        layer_idx: usize,
        vb: VarBuilder,
    ) -> Result<Box<dyn EncoderLayer>> {
        Ok(Box::new(TransformerLayer::new(config, layer_idx, vb)?))
    }
}
