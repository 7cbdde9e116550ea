//! Encoder stack.
//!
//! This module provides:
//! - [`Encoder`] - Sequence of main layers with optional N-gram fusion
//! - [`RecomputeTape`] - Recompute regions for checkpointed execution
//! - [`chunk_ranges`] - Layer partitioning for checkpointing
//!
//! The execution strategy is resolved once at construction: sequential, or
//! checkpointed in chunks of `ceil(sqrt(num_layers))` layers.

mod checkpoint;

pub use checkpoint::{chunk_ranges, chunk_size, RecomputeTape};

use crate::error::{Result, RobertaError};
use crate::kernel::KernelProvider;
use crate::model::{
    EncoderLayer, ForwardCtx, ModelConfig, Norm, NormPlacement, TransformerLayer, NORM_EPS,
};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarBuilder;
use std::ops::Range;
use tracing::debug;

/// N-gram stream inputs for one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct NgramInputs<'a> {
    /// N-gram embedding output [batch, ngram_seq, hidden].
    pub hidden_states: &'a Tensor,
    /// N-gram attention bias [batch, 1, 1, ngram_seq].
    pub attention_bias: &'a Tensor,
    /// Position mapping [batch, seq, ngram_seq].
    pub position_matrix: &'a Tensor,
}

/// What the encoder records besides the final hidden state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncoderOptions {
    /// Record the hidden state after every layer.
    pub output_all_encoded_layers: bool,
    /// Record the attention probabilities of every layer.
    pub output_attentions: bool,
}

/// Encoder result.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Per-layer hidden states when recording all layers, otherwise only
    /// the final (normalized) hidden state.
    pub hidden_states: Vec<Tensor>,
    /// Final hidden state, normalized in pre-norm mode.
    pub last_hidden_state: Tensor,
    /// Per-layer attention probabilities, when requested.
    pub attentions: Option<Vec<Tensor>>,
}

#[derive(Debug)]
enum Strategy {
    Sequential,
    Checkpointed {
        chunks: Vec<Range<usize>>,
        tape: RecomputeTape,
    },
}

/// Stack of encoder layers.
#[derive(Debug)]
pub struct Encoder {
    layers: Vec<Box<dyn EncoderLayer>>,
    /// One per fused main layer; empty without N-gram fusion.
    ngram_layers: Vec<TransformerLayer>,
    /// Present in pre-norm mode.
    final_norm: Option<Norm>,
    strategy: Strategy,
    span: tracing::Span,
}

impl Encoder {
    /// Build the stack with parameters under `vb`.
    ///
    /// With `fused_transformer_kernel` set, every main layer comes from
    /// `kernels`; a missing provider is an error.
    pub fn new(
        config: &ModelConfig,
        vb: VarBuilder,
        kernels: Option<&dyn KernelProvider>,
    ) -> Result<Self> {
        config.validate()?;
        if config.checkpoint_activations && config.is_ngram {
            return Err(RobertaError::IncompatibleOptions(
                "activation checkpointing cannot be combined with N-gram fusion".to_string(),
            ));
        }

        let layers = if config.fused_transformer_kernel {
            let provider = kernels.ok_or_else(|| {
                RobertaError::MissingCapability(
                    "fused transformer kernel requested but no kernel provider is installed"
                        .to_string(),
                )
            })?;
            debug!(provider = provider.name(), "substituting fused kernel layers");
            let vb = vb.pp("fused_layer");
            (0..config.num_hidden_layers)
                .map(|i| provider.build_layer(config, i, vb.pp(i)))
                .collect::<Result<Vec<_>>>()?
        } else {
            let vb = vb.pp("layer");
            (0..config.num_hidden_layers)
                .map(|i| {
                    TransformerLayer::new(config, i, vb.pp(i))
                        .map(|layer| Box::new(layer) as Box<dyn EncoderLayer>)
                })
                .collect::<Result<Vec<_>>>()?
        };

        let ngram_layers = if config.is_ngram {
            let vb = vb.pp("ngram_layer");
            (0..config.num_hidden_ngram_layers)
                .map(|i| TransformerLayer::new(config, i, vb.pp(i)))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        let final_norm = if config.use_ln && config.norm_placement()? == NormPlacement::Pre {
            Some(Norm::from_config(config, NORM_EPS, vb.pp("final_norm"))?)
        } else {
            None
        };

        let strategy = if config.checkpoint_activations {
            let chunks = chunk_ranges(config.num_hidden_layers);
            debug!(chunks = ?chunks, "checkpointed encoder");
            Strategy::Checkpointed {
                chunks,
                tape: RecomputeTape::new(),
            }
        } else {
            debug!("sequential encoder");
            Strategy::Sequential
        };

        Ok(Self {
            layers,
            ngram_layers,
            final_norm,
            strategy,
            span: tracing::span!(tracing::Level::TRACE, "encoder"),
        })
    }

    /// Number of main layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of N-gram layers fused into the main stream.
    pub fn num_ngram_layers(&self) -> usize {
        self.ngram_layers.len()
    }

    /// Whether the N-gram stream is fused in.
    pub fn has_ngram_fusion(&self) -> bool {
        !self.ngram_layers.is_empty()
    }

    /// Checkpoint chunks, if checkpointing.
    pub fn chunks(&self) -> Option<&[Range<usize>]> {
        match &self.strategy {
            Strategy::Sequential => None,
            Strategy::Checkpointed { chunks, .. } => Some(chunks),
        }
    }

    /// Run the stack over the embedding output.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        ngram: Option<NgramInputs<'_>>,
        options: EncoderOptions,
        ctx: &ForwardCtx,
    ) -> Result<EncoderOutput> {
        let _enter = self.span.enter();
        if self.has_ngram_fusion() && ngram.is_none() {
            return Err(RobertaError::MissingInput(
                "N-gram fusion is enabled but no N-gram inputs were given".to_string(),
            ));
        }

        let (hidden_states, mut recorded, attentions) = match &self.strategy {
            Strategy::Sequential => {
                self.forward_sequential(hidden_states, attention_bias, ngram, options, ctx)?
            }
            Strategy::Checkpointed { chunks, tape } => {
                if options.output_attentions {
                    return Err(RobertaError::IncompatibleOptions(
                        "attention probabilities are not recorded under checkpointing"
                            .to_string(),
                    ));
                }
                let last = if ctx.is_train() {
                    tape.forward(hidden_states, attention_bias, chunks, ctx, |r, x, b, c| {
                        self.run_layers(r, x, b, c)
                    })?
                } else {
                    tape.clear();
                    self.run_layers(0..self.layers.len(), hidden_states, attention_bias, ctx)?
                };
                (last, Vec::new(), None)
            }
        };

        let last_hidden_state = match &self.final_norm {
            Some(norm) => norm.forward(&hidden_states)?,
            None => hidden_states,
        };
        if recorded.is_empty() {
            recorded.push(last_hidden_state.clone());
        }

        Ok(EncoderOutput {
            hidden_states: recorded,
            last_hidden_state,
            attentions,
        })
    }

    fn forward_sequential(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        ngram: Option<NgramInputs<'_>>,
        options: EncoderOptions,
        ctx: &ForwardCtx,
    ) -> Result<(Tensor, Vec<Tensor>, Option<Vec<Tensor>>)> {
        let mut hidden = hidden_states.clone();
        let mut ngram_hidden = ngram.map(|n| n.hidden_states.clone());
        let mut recorded = Vec::new();
        let mut attentions = options.output_attentions.then(Vec::new);

        for (i, layer) in self.layers.iter().enumerate() {
            let out = layer.forward(&hidden, attention_bias, ctx)?;
            hidden = out.hidden_states;

            if let (Some(inputs), Some(ngram_layer), Some(current)) =
                (ngram, self.ngram_layers.get(i), ngram_hidden.as_ref())
            {
                let ngram_out = ngram_layer.forward(current, inputs.attention_bias, ctx)?;
                let fused = inputs.position_matrix.matmul(&ngram_out.hidden_states)?;
                hidden = (hidden + fused)?;
                ngram_hidden = Some(ngram_out.hidden_states);
            }

            if options.output_all_encoded_layers {
                recorded.push(hidden.clone());
            }
            if let (Some(list), Some(probs)) = (attentions.as_mut(), out.attention_probs) {
                list.push(probs);
            }
        }
        Ok((hidden, recorded, attentions))
    }

    fn run_layers(
        &self,
        layers: Range<usize>,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        ctx: &ForwardCtx,
    ) -> Result<Tensor> {
        let mut hidden = hidden_states.clone();
        for layer in &self.layers[layers] {
            hidden = layer.forward(&hidden, attention_bias, ctx)?.hidden_states;
        }
        Ok(hidden)
    }

    /// Backpropagate `loss`, replaying recompute regions when checkpointing.
    pub fn backward(&self, loss: &Tensor, params: &[Var]) -> Result<GradStore> {
        match &self.strategy {
            Strategy::Sequential => Ok(loss.backward()?),
            Strategy::Checkpointed { tape, .. } => {
                tape.backward(loss, params, |r, x, b, c| self.run_layers(r, x, b, c))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::attention_bias;
    use crate::kernel::ReferenceKernels;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vals(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn assert_close(a: &Tensor, b: &Tensor) {
        for (p, q) in vals(a).iter().zip(vals(b)) {
            assert!((p - q).abs() < 1e-5, "{p} vs {q}");
        }
    }

    fn full_bias(batch: usize, seq: usize) -> Tensor {
        let mask = Tensor::ones((batch, seq), DType::U32, &Device::Cpu).unwrap();
        attention_bias(&mask, DType::F32).unwrap()
    }

    fn build(config: &ModelConfig, varmap: &VarMap) -> Encoder {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        Encoder::new(config, vb, None).unwrap()
    }

    #[test]
    fn recording_does_not_change_final_state() {
        let config = ModelConfig {
            num_hidden_layers: 3,
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let encoder = build(&config, &varmap);
        let x = Tensor::randn(0.0f32, 1.0, &[2, 5, 16], &Device::Cpu).unwrap();
        let bias = full_bias(2, 5);

        let last_only = encoder
            .forward(&x, &bias, None, EncoderOptions::default(), &ForwardCtx::eval())
            .unwrap();
        let all = encoder
            .forward(
                &x,
                &bias,
                None,
                EncoderOptions {
                    output_all_encoded_layers: true,
                    output_attentions: true,
                },
                &ForwardCtx::eval(),
            )
            .unwrap();

        assert_eq!(vals(&last_only.last_hidden_state), vals(&all.last_hidden_state));
        assert_eq!(last_only.hidden_states.len(), 1);
        assert_eq!(all.hidden_states.len(), 3);
        assert_eq!(all.attentions.unwrap().len(), 3);
        assert!(last_only.attentions.is_none());
    }

    #[test]
    fn post_norm_has_no_final_norm() {
        let config = ModelConfig {
            encoder_ln_mode: "post-ln".into(),
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let encoder = build(&config, &varmap);
        assert!(encoder.final_norm.is_none());
        assert!(!varmap
            .data()
            .lock()
            .unwrap()
            .keys()
            .any(|k| k.starts_with("final_norm")));

        let x = Tensor::randn(0.0f32, 1.0, &[1, 4, 16], &Device::Cpu).unwrap();
        let out = encoder
            .forward(
                &x,
                &full_bias(1, 4),
                None,
                EncoderOptions {
                    output_all_encoded_layers: true,
                    output_attentions: false,
                },
                &ForwardCtx::eval(),
            )
            .unwrap();
        assert_eq!(vals(&out.hidden_states[1]), vals(&out.last_hidden_state));
    }

    #[test]
    fn ngram_fusion_adds_projected_stream() {
        let config = ModelConfig {
            is_ngram: true,
            num_hidden_ngram_layers: 1,
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let encoder = build(&config, &varmap);
        assert!(encoder.has_ngram_fusion());
        assert_eq!(encoder.num_ngram_layers(), 1);

        let x = Tensor::randn(0.0f32, 1.0, &[1, 4, 16], &Device::Cpu).unwrap();
        let bias = full_bias(1, 4);
        let ngram_hidden = Tensor::randn(0.0f32, 1.0, &[1, 3, 16], &Device::Cpu).unwrap();
        let ngram_bias = full_bias(1, 3);
        let zeros = Tensor::zeros((1, 4, 3), DType::F32, &Device::Cpu).unwrap();
        let ones = Tensor::ones((1, 4, 3), DType::F32, &Device::Cpu).unwrap();

        let run = |matrix: &Tensor| {
            encoder
                .forward(
                    &x,
                    &bias,
                    Some(NgramInputs {
                        hidden_states: &ngram_hidden,
                        attention_bias: &ngram_bias,
                        position_matrix: matrix,
                    }),
                    EncoderOptions::default(),
                    &ForwardCtx::eval(),
                )
                .unwrap()
                .last_hidden_state
        };

        // A zero mapping contributes nothing: same as a plain stack.
        let plain_config = ModelConfig::tiny();
        let plain = build(&plain_config, &varmap);
        let reference = plain
            .forward(&x, &bias, None, EncoderOptions::default(), &ForwardCtx::eval())
            .unwrap()
            .last_hidden_state;
        assert_close(&run(&zeros), &reference);
        assert_ne!(vals(&run(&ones)), vals(&reference));
    }

    #[test]
    fn ngram_layers_chain_and_fuse_only_into_leading_layers() {
        let config = ModelConfig {
            num_hidden_layers: 3,
            is_ngram: true,
            num_hidden_ngram_layers: 2,
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let encoder = build(&config, &varmap);
        assert_eq!(encoder.num_ngram_layers(), 2);

        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, &[1, 4, 16], &device).unwrap();
        let bias = full_bias(1, 4);
        let ngram_hidden = Tensor::randn(0.0f32, 1.0, &[1, 3, 16], &device).unwrap();
        let ngram_bias = full_bias(1, 3);
        let matrix = Tensor::rand(0.0f32, 1.0, &[1, 4, 3], &device).unwrap();
        let ctx = ForwardCtx::eval();

        let out = encoder
            .forward(
                &x,
                &bias,
                Some(NgramInputs {
                    hidden_states: &ngram_hidden,
                    attention_bias: &ngram_bias,
                    position_matrix: &matrix,
                }),
                EncoderOptions {
                    output_all_encoded_layers: true,
                    output_attentions: false,
                },
                &ctx,
            )
            .unwrap();
        assert_eq!(out.hidden_states.len(), 3);

        // Same parameters, chained by hand.
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let main: Vec<TransformerLayer> = (0..3)
            .map(|i| TransformerLayer::new(&config, i, vb.pp("layer").pp(i)).unwrap())
            .collect();
        let ngram: Vec<TransformerLayer> = (0..2)
            .map(|i| TransformerLayer::new(&config, i, vb.pp("ngram_layer").pp(i)).unwrap())
            .collect();

        let mut hidden = x.clone();
        let mut ngram_state = ngram_hidden.clone();
        for (i, layer) in main.iter().enumerate() {
            hidden = layer.forward(&hidden, &bias, &ctx).unwrap().hidden_states;
            let unfused = hidden.clone();
            if let Some(ngram_layer) = ngram.get(i) {
                ngram_state = ngram_layer
                    .forward(&ngram_state, &ngram_bias, &ctx)
                    .unwrap()
                    .hidden_states;
                hidden = (hidden + matrix.matmul(&ngram_state).unwrap()).unwrap();
                assert_ne!(vals(&out.hidden_states[i]), vals(&unfused));
            } else {
                assert_close(&out.hidden_states[i], &unfused);
            }
            assert_close(&out.hidden_states[i], &hidden);
        }
    }

    #[test]
    fn ngram_fusion_requires_inputs() {
        let config = ModelConfig {
            is_ngram: true,
            ..ModelConfig::tiny()
        };
        let encoder = build(&config, &VarMap::new());
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 16], &Device::Cpu).unwrap();
        let err = encoder
            .forward(&x, &full_bias(1, 2), None, EncoderOptions::default(), &ForwardCtx::eval())
            .unwrap_err();
        assert!(matches!(err, RobertaError::MissingInput(_)));
    }

    #[test]
    fn checkpointing_rejects_ngram_and_attentions() {
        let config = ModelConfig {
            is_ngram: true,
            checkpoint_activations: true,
            ..ModelConfig::tiny()
        };
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &Device::Cpu);
        assert!(matches!(
            Encoder::new(&config, vb, None),
            Err(RobertaError::IncompatibleOptions(_))
        ));

        let config = ModelConfig {
            checkpoint_activations: true,
            ..ModelConfig::tiny()
        };
        let encoder = build(&config, &VarMap::new());
        let x = Tensor::randn(0.0f32, 1.0, &[1, 2, 16], &Device::Cpu).unwrap();
        let options = EncoderOptions {
            output_all_encoded_layers: false,
            output_attentions: true,
        };
        assert!(matches!(
            encoder.forward(&x, &full_bias(1, 2), None, options, &ForwardCtx::eval()),
            Err(RobertaError::IncompatibleOptions(_))
        ));
    }

    #[test]
    fn checkpointed_forward_and_backward_match_sequential() {
        let base = ModelConfig {
            num_hidden_layers: 5,
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let sequential = build(&base, &varmap);
        let checkpointed = build(
            &ModelConfig {
                checkpoint_activations: true,
                ..base.clone()
            },
            &varmap,
        );
        assert_eq!(checkpointed.chunks().unwrap(), &[0..3, 3..5]);
        assert!(sequential.chunks().is_none());

        let x = Var::from_tensor(
            &Tensor::randn(0.0f32, 1.0, &[2, 3, 16], &Device::Cpu).unwrap(),
        )
        .unwrap();
        let bias = full_bias(2, 3);
        let mut params = varmap.all_vars();
        params.push(x.clone());

        let a = sequential
            .forward(x.as_tensor(), &bias, None, EncoderOptions::default(), &ForwardCtx::train(5))
            .unwrap();
        let b = checkpointed
            .forward(x.as_tensor(), &bias, None, EncoderOptions::default(), &ForwardCtx::train(5))
            .unwrap();
        assert_close(&a.last_hidden_state, &b.last_hidden_state);

        let loss_a = a.last_hidden_state.sqr().unwrap().sum_all().unwrap();
        let loss_b = b.last_hidden_state.sqr().unwrap().sum_all().unwrap();
        let grads_a = sequential.backward(&loss_a, &params).unwrap();
        let grads_b = checkpointed.backward(&loss_b, &params).unwrap();

        for var in &params {
            match (grads_a.get(var), grads_b.get(var)) {
                (Some(ga), Some(gb)) => {
                    for (p, q) in vals(ga).iter().zip(vals(gb)) {
                        assert!((p - q).abs() < 1e-4, "{p} vs {q}");
                    }
                }
                (None, None) => {}
                _ => panic!("gradient present in only one mode"),
            }
        }
    }

    #[test]
    fn fused_kernel_needs_provider() {
        let config = ModelConfig {
            fused_transformer_kernel: true,
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            Encoder::new(&config, vb.clone(), None),
            Err(RobertaError::MissingCapability(_))
        ));

        let encoder = Encoder::new(&config, vb, Some(&ReferenceKernels)).unwrap();
        assert_eq!(encoder.num_layers(), 2);
        let data = varmap.data().lock().unwrap();
        assert!(data.keys().any(|k| k.starts_with("fused_layer.1.")));
        assert!(!data.keys().any(|k| k.starts_with("layer.")));
    }
}
