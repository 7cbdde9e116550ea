//! Token-level and sentence-pair prediction heads.

use crate::error::Result;
use crate::model::{linear, DenseActivation, ModelConfig, Norm, NORM_EPS};
use candle_core::{Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

/// Dense + configured activation, then the configured norm when
/// normalization is enabled.
#[derive(Debug, Clone)]
pub struct PredictionHeadTransform {
    dense: DenseActivation,
    norm: Option<Norm>,
}

impl PredictionHeadTransform {
    /// Create with parameters under `vb` (`dense`, `norm`).
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dense = DenseActivation::new(
            config.hidden_size,
            config.hidden_size,
            config.activation()?,
            config.fused_linear_layer,
            config.initializer_range,
            vb.pp("dense"),
        )?;
        let norm = if config.use_ln {
            Some(Norm::from_config(config, NORM_EPS, vb.pp("norm"))?)
        } else {
            None
        };
        Ok(Self { dense, norm })
    }

    /// Forward pass over `[..., hidden]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.dense.forward(x)?;
        match &self.norm {
            Some(norm) => norm.forward(&x),
            None => Ok(x),
        }
    }
}

/// Where the masked rows are selected relative to the vocabulary projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionMode {
    /// Gather masked rows first; only those are transformed and decoded.
    Sparse,
    /// Transform and decode every position, then gather.
    Dense,
}

/// Masked-LM head with its decoder tied to the token table.
///
/// The decoder weight is the embedding table itself, not a copy: updates to
/// either are visible through both. A vocabulary-sized bias is always
/// allocated but only added in [`PredictionMode::Dense`]; in sparse mode it
/// stays an unused parameter.
#[derive(Debug, Clone)]
pub struct LmPredictionHead {
    transform: PredictionHeadTransform,
    /// Shared with the word embeddings: [vocab, hidden].
    decoder_weight: Tensor,
    bias: Tensor,
    mode: PredictionMode,
    span: tracing::Span,
}

impl LmPredictionHead {
    /// Create with parameters under `vb`, decoding through `word_embeddings`.
    pub fn new(config: &ModelConfig, word_embeddings: &Tensor, vb: VarBuilder) -> Result<Self> {
        let transform = PredictionHeadTransform::new(config, vb.pp("transform"))?;
        let bias = vb.get_with_hints(config.vocab_size, "bias", Init::Const(0.0))?;
        let mode = if config.sparse_mask_prediction {
            PredictionMode::Sparse
        } else {
            PredictionMode::Dense
        };
        Ok(Self {
            transform,
            decoder_weight: word_embeddings.clone(),
            bias,
            mode,
            span: tracing::span!(tracing::Level::TRACE, "lm-head"),
        })
    }

    fn decode(&self, x: &Tensor) -> Result<Tensor> {
        let logits = x.broadcast_matmul(&self.decoder_weight.t()?)?;
        match self.mode {
            PredictionMode::Sparse => Ok(logits),
            PredictionMode::Dense => Ok(logits.broadcast_add(&self.bias)?),
        }
    }

    /// Logits for every position: `[batch, seq, hidden]` -> `[batch, seq, vocab]`.
    pub fn forward_all(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.decode(&self.transform.forward(hidden_states)?)
    }

    /// Logits for the flat positions in `masked_indexes` ([M], u32):
    /// `[batch, seq, hidden]` -> `[M, vocab]`.
    pub fn forward(&self, hidden_states: &Tensor, masked_indexes: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (batch, seq_len, hidden) = hidden_states.dims3()?;
        match self.mode {
            PredictionMode::Sparse => {
                let rows = hidden_states
                    .reshape((batch * seq_len, hidden))?
                    .index_select(masked_indexes, 0)?;
                self.decode(&self.transform.forward(&rows)?)
            }
            PredictionMode::Dense => {
                let logits = self.decode(&self.transform.forward(hidden_states)?)?;
                let vocab = logits.dim(2)?;
                Ok(logits
                    .reshape((batch * seq_len, vocab))?
                    .index_select(masked_indexes, 0)?)
            }
        }
    }

    /// Selected evaluation mode.
    pub fn mode(&self) -> PredictionMode {
        self.mode
    }

    /// Decoder weight, shared with the token table.
    pub fn decoder_weight(&self) -> &Tensor {
        &self.decoder_weight
    }

    /// Vocabulary bias.
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

/// Two-way sentence-pair relationship classifier over the pooled output.
#[derive(Debug, Clone)]
pub struct NspHead {
    seq_relationship: Linear,
}

impl NspHead {
    /// Create with parameters under `vb` (`seq_relationship`).
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            seq_relationship: linear(
                config.hidden_size,
                2,
                config.initializer_range,
                vb.pp("seq_relationship"),
            )?,
        })
    }

    /// `[batch, hidden]` -> `[batch, 2]`
    pub fn forward(&self, pooled_output: &Tensor) -> Result<Tensor> {
        Ok(self.seq_relationship.forward(pooled_output)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Embeddings, ForwardCtx};
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn vals(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn build(config: &ModelConfig, varmap: &VarMap) -> (Embeddings, LmPredictionHead) {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let embeddings = Embeddings::new(config, vb.pp("embeddings")).unwrap();
        let head =
            LmPredictionHead::new(config, embeddings.word_embeddings(), vb.pp("lm_head")).unwrap();
        (embeddings, head)
    }

    #[test]
    fn decoder_is_tied_to_token_table() {
        let varmap = VarMap::new();
        let (embeddings, head) = build(&ModelConfig::tiny(), &varmap);
        assert_eq!(head.decoder_weight().id(), embeddings.word_embeddings().id());

        // Mutating the parameter is visible through both owners.
        let table = varmap
            .data()
            .lock()
            .unwrap()
            .get("embeddings.word_embeddings.weight")
            .cloned()
            .unwrap();
        let replacement = Tensor::ones((32, 16), DType::F32, &Device::Cpu).unwrap();
        table.set(&replacement).unwrap();
        assert!(vals(head.decoder_weight()).iter().all(|v| *v == 1.0));
        assert!(vals(embeddings.word_embeddings()).iter().all(|v| *v == 1.0));

        let ids = Tensor::new(&[[2u32]], &Device::Cpu).unwrap();
        let embedded = embeddings.forward(&ids, None, &ForwardCtx::eval()).unwrap();
        assert_eq!(embedded.dims(), &[1, 1, 16]);
    }

    #[test]
    fn sparse_rows_match_dense_rows() {
        let varmap = VarMap::new();
        let sparse_config = ModelConfig::tiny();
        let dense_config = ModelConfig {
            sparse_mask_prediction: false,
            ..ModelConfig::tiny()
        };
        let (embeddings, sparse) = build(&sparse_config, &varmap);
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dense =
            LmPredictionHead::new(&dense_config, embeddings.word_embeddings(), vb.pp("lm_head"))
                .unwrap();
        assert_eq!(sparse.mode(), PredictionMode::Sparse);
        assert_eq!(dense.mode(), PredictionMode::Dense);

        let hidden = Tensor::randn(0.0f32, 1.0, &[2, 5, 16], &Device::Cpu).unwrap();
        // Positions (0, 2) and (1, 0).
        let idx = Tensor::new(&[2u32, 5], &Device::Cpu).unwrap();

        let a = sparse.forward(&hidden, &idx).unwrap();
        let b = dense.forward(&hidden, &idx).unwrap();
        assert_eq!(a.dims(), &[2, 32]);
        // The bias is zero-initialized, so both modes agree.
        for (p, q) in vals(&a).iter().zip(vals(&b)) {
            assert!((p - q).abs() < 1e-5);
        }

        let all = dense.forward_all(&hidden).unwrap();
        assert_eq!(all.dims(), &[2, 5, 32]);
        for (p, q) in vals(&all.i((1, 0)).unwrap()).iter().zip(vals(&b.i(1).unwrap())) {
            assert!((p - q).abs() < 1e-5);
        }
    }

    #[test]
    fn sparse_mode_leaves_bias_unused() {
        let varmap = VarMap::new();
        let (_, sparse) = build(&ModelConfig::tiny(), &varmap);
        assert_eq!(sparse.bias().dims(), &[32]);

        let hidden = Tensor::randn(0.0f32, 1.0, &[1, 3, 16], &Device::Cpu).unwrap();
        let idx = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        let before = vals(&sparse.forward(&hidden, &idx).unwrap());

        let bias = varmap.data().lock().unwrap().get("lm_head.bias").cloned().unwrap();
        bias.set(&Tensor::full(5.0f32, 32, &Device::Cpu).unwrap()).unwrap();
        let after = vals(&sparse.forward(&hidden, &idx).unwrap());
        assert_eq!(before, after);

        // The dense head built over the same parameters does add it.
        let config = ModelConfig {
            sparse_mask_prediction: false,
            ..ModelConfig::tiny()
        };
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let table = varmap
            .data()
            .lock()
            .unwrap()
            .get("embeddings.word_embeddings.weight")
            .cloned()
            .unwrap();
        let dense = LmPredictionHead::new(&config, table.as_tensor(), vb.pp("lm_head")).unwrap();
        let shifted = vals(&dense.forward(&hidden, &idx).unwrap());
        for (p, q) in before.iter().zip(shifted) {
            assert!((q - p - 5.0).abs() < 1e-4);
        }
    }

    #[test]
    fn transform_has_no_norm_without_use_ln() {
        let config = ModelConfig {
            use_ln: false,
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let transform = PredictionHeadTransform::new(&config, vb).unwrap();
        assert!(transform.norm.is_none());
        let x = Tensor::randn(0.0f32, 1.0, &[3, 16], &Device::Cpu).unwrap();
        assert_eq!(transform.forward(&x).unwrap().dims(), &[3, 16]);
    }

    #[test]
    fn nsp_head_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = NspHead::new(&ModelConfig::tiny(), vb).unwrap();
        let pooled = Tensor::randn(0.0f32, 1.0, &[4, 16], &Device::Cpu).unwrap();
        assert_eq!(head.forward(&pooled).unwrap().dims(), &[4, 2]);
    }
}
