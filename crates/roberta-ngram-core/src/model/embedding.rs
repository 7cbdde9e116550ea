//! Token, position and segment embeddings for both streams.

use super::{Dropout, ForwardCtx, ModelConfig, Norm, NORM_EPS};
use crate::error::{Result, RobertaError};
use candle_core::backprop::GradStore;
use candle_core::{Module, Tensor};
use candle_nn::{Embedding, Init, VarBuilder};

/// Name of the N-gram token table, relative to the model root.
pub const NGRAM_TOKEN_TABLE: &str = "ngram_embeddings.word_embeddings.weight";

fn table(rows: usize, hidden: usize, std: f64, vb: VarBuilder) -> Result<Embedding> {
    let weight = vb.get_with_hints(
        (rows, hidden),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: std,
        },
    )?;
    Ok(Embedding::new(weight, hidden))
}

fn segments_or_zeros(input_ids: &Tensor, token_type_ids: Option<&Tensor>) -> Result<Tensor> {
    match token_type_ids {
        Some(ids) => Ok(ids.clone()),
        None => Ok(input_ids.zeros_like()?),
    }
}

/// Main-stream embeddings: `word + position + segment`, optionally
/// normalized, then dropout.
#[derive(Debug, Clone)]
pub struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    norm: Option<Norm>,
    dropout: Dropout,
    max_positions: usize,
    span: tracing::Span,
}

impl Embeddings {
    /// Create with parameters under `vb`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let std = config.initializer_range;
        let norm = if config.layernorm_embedding {
            Some(Norm::from_config(config, NORM_EPS, vb.pp("norm"))?)
        } else {
            None
        };
        Ok(Self {
            word_embeddings: table(config.vocab_size, hidden, std, vb.pp("word_embeddings"))?,
            position_embeddings: table(
                config.max_position_embeddings,
                hidden,
                std,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: table(
                config.type_vocab_size,
                hidden,
                std,
                vb.pp("token_type_embeddings"),
            )?,
            norm,
            dropout: Dropout::new(config.hidden_dropout_prob),
            max_positions: config.max_position_embeddings,
            span: tracing::span!(tracing::Level::TRACE, "embeddings"),
        })
    }

    /// Embed `input_ids` [batch, seq]; missing segment ids default to zero.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: Option<&Tensor>,
        ctx: &ForwardCtx,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_positions {
            return Err(RobertaError::ShapeMismatch(format!(
                "sequence length {seq_len} exceeds {} positions",
                self.max_positions
            )));
        }

        let token_type_ids = segments_or_zeros(input_ids, token_type_ids)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;

        let words = self.word_embeddings.forward(input_ids)?;
        let positions = self.position_embeddings.forward(&position_ids)?;
        let segments = self.token_type_embeddings.forward(&token_type_ids)?;

        let mut embeddings = (words.broadcast_add(&positions)? + segments)?;
        if let Some(norm) = &self.norm {
            embeddings = norm.forward(&embeddings)?;
        }
        self.dropout.forward(&embeddings, ctx)
    }

    /// The token table [vocab, hidden]; the MLM decoder reads through it.
    pub fn word_embeddings(&self) -> &Tensor {
        self.word_embeddings.embeddings()
    }

    /// Whether the embeddings are normalized before the layers.
    pub fn is_normalized(&self) -> bool {
        self.norm.is_some()
    }
}

/// N-gram stream embeddings: `word + segment`, no position term, always
/// standard-normalized with `layer_norm_eps`.
#[derive(Debug, Clone)]
pub struct NgramEmbeddings {
    word_embeddings: Embedding,
    token_type_embeddings: Embedding,
    norm: Norm,
    dropout: Dropout,
    /// Row of the token table that never receives updates.
    padding_idx: usize,
    span: tracing::Span,
}

impl NgramEmbeddings {
    /// Create with parameters under `vb`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let std = config.initializer_range;
        Ok(Self {
            word_embeddings: table(config.ngram_vocab_size, hidden, std, vb.pp("word_embeddings"))?,
            token_type_embeddings: table(
                config.type_vocab_size,
                hidden,
                std,
                vb.pp("token_type_embeddings"),
            )?,
            norm: Norm::standard(hidden, config.layer_norm_eps, vb.pp("norm"))?,
            dropout: Dropout::new(config.hidden_dropout_prob),
            padding_idx: config.pad_token_id as usize,
            span: tracing::span!(tracing::Level::TRACE, "ngram-embeddings"),
        })
    }

    /// Embed N-gram ids [batch, ngram_seq].
    pub fn forward(
        &self,
        ngram_ids: &Tensor,
        token_type_ids: Option<&Tensor>,
        ctx: &ForwardCtx,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let token_type_ids = segments_or_zeros(ngram_ids, token_type_ids)?;
        let words = self.word_embeddings.forward(ngram_ids)?;
        let segments = self.token_type_embeddings.forward(&token_type_ids)?;
        let embeddings = self.norm.forward(&(words + segments)?)?;
        self.dropout.forward(&embeddings, ctx)
    }

    /// The N-gram token table [ngram_vocab, hidden].
    pub fn word_embeddings(&self) -> &Tensor {
        self.word_embeddings.embeddings()
    }

    /// Padding row of the N-gram token table.
    pub fn padding_idx(&self) -> usize {
        self.padding_idx
    }

    /// Zero the padding row of the token table's gradient, if any.
    pub fn mask_padding_grad(&self, grads: &mut GradStore) -> Result<()> {
        let table = self.word_embeddings();
        if let Some(grad) = grads.get(table) {
            let masked = zero_row(grad, self.padding_idx)?;
            grads.insert(table, masked);
        }
        Ok(())
    }
}

/// `table` [rows, cols] with row `row` set to zero.
pub(crate) fn zero_row(table: &Tensor, row: usize) -> Result<Tensor> {
    let rows = table.dim(0)?;
    if row >= rows {
        return Ok(table.clone());
    }
    let keep: Vec<f32> = (0..rows).map(|i| if i == row { 0.0 } else { 1.0 }).collect();
    let keep = Tensor::from_vec(keep, (rows, 1), table.device())?.to_dtype(table.dtype())?;
    Ok(table.broadcast_mul(&keep)?)
}
