//! Base encoder model: embeddings, encoder stack and pooler.

use super::{Embeddings, ForwardCtx, ModelConfig, NgramEmbeddings};
use crate::attention::attention_bias_or_default;
use crate::encoder::{Encoder, EncoderOptions, NgramInputs};
use crate::error::{Result, RobertaError};
use crate::heads::Pooler;
use crate::kernel::KernelProvider;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::VarBuilder;

/// N-gram stream tensors for one batch.
#[derive(Debug, Clone)]
pub struct NgramBatch {
    /// N-gram ids [batch, ngram_seq].
    pub input_ids: Tensor,
    /// N-gram padding mask [batch, ngram_seq]; all ones when absent.
    pub attention_mask: Option<Tensor>,
    /// N-gram segment ids [batch, ngram_seq]; all zeros when absent.
    pub token_type_ids: Option<Tensor>,
    /// Position mapping [batch, seq, ngram_seq].
    pub position_matrix: Tensor,
}

/// Inputs of the base model.
#[derive(Debug, Clone, Copy)]
pub struct ModelInputs<'a> {
    /// Token ids [batch, seq].
    pub input_ids: &'a Tensor,
    /// Segment ids [batch, seq]; all zeros when absent.
    pub token_type_ids: Option<&'a Tensor>,
    /// Padding mask [batch, seq]; all ones when absent.
    pub attention_mask: Option<&'a Tensor>,
    /// N-gram stream, required when N-gram fusion is enabled.
    pub ngram: Option<&'a NgramBatch>,
}

impl<'a> ModelInputs<'a> {
    /// Token ids only; every other input takes its default.
    pub fn new(input_ids: &'a Tensor) -> Self {
        Self {
            input_ids,
            token_type_ids: None,
            attention_mask: None,
            ngram: None,
        }
    }
}

/// Base model output.
#[derive(Debug, Clone)]
pub struct RobertaOutput {
    /// Per-layer hidden states, or only the final one.
    pub encoded_layers: Vec<Tensor>,
    /// Final hidden state [batch, seq, hidden].
    pub sequence_output: Tensor,
    /// Pooled first-token representation [batch, hidden].
    pub pooled_output: Tensor,
    /// Per-layer attention probabilities, when requested.
    pub attentions: Option<Vec<Tensor>>,
}

/// Embeddings, encoder stack and pooler.
#[derive(Debug)]
pub struct RobertaModel {
    embeddings: Embeddings,
    ngram_embeddings: Option<NgramEmbeddings>,
    encoder: Encoder,
    pooler: Pooler,
    dtype: DType,
}

impl RobertaModel {
    /// Build with parameters under `vb`.
    pub fn new(
        config: &ModelConfig,
        vb: VarBuilder,
        kernels: Option<&dyn KernelProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let ngram_embeddings = if config.is_ngram {
            Some(NgramEmbeddings::new(config, vb.pp("ngram_embeddings"))?)
        } else {
            None
        };
        Ok(Self {
            embeddings: Embeddings::new(config, vb.pp("embeddings"))?,
            ngram_embeddings,
            encoder: Encoder::new(config, vb.pp("encoder"), kernels)?,
            pooler: Pooler::new(config, vb.pp("pooler"))?,
            dtype: vb.dtype(),
        })
    }

    /// Run embeddings, encoder and pooler.
    pub fn forward(
        &self,
        inputs: ModelInputs<'_>,
        options: EncoderOptions,
        ctx: &ForwardCtx,
    ) -> Result<RobertaOutput> {
        let bias =
            attention_bias_or_default(inputs.attention_mask, inputs.input_ids, self.dtype)?;
        let embedding_output =
            self.embeddings.forward(inputs.input_ids, inputs.token_type_ids, ctx)?;

        let ngram_state = match (&self.ngram_embeddings, inputs.ngram) {
            (Some(embeddings), Some(batch)) => {
                let hidden = embeddings.forward(
                    &batch.input_ids,
                    batch.token_type_ids.as_ref(),
                    ctx,
                )?;
                let bias = attention_bias_or_default(
                    batch.attention_mask.as_ref(),
                    &batch.input_ids,
                    self.dtype,
                )?;
                let matrix = batch.position_matrix.to_dtype(self.dtype)?;
                Some((hidden, bias, matrix))
            }
            (Some(_), None) => {
                return Err(RobertaError::MissingInput(
                    "N-gram stream enabled but the batch has no N-gram tensors".to_string(),
                ))
            }
            (None, _) => None,
        };
        let ngram = ngram_state
            .as_ref()
            .map(|(hidden_states, attention_bias, position_matrix)| NgramInputs {
                hidden_states,
                attention_bias,
                position_matrix,
            });

        let encoded = self
            .encoder
            .forward(&embedding_output, &bias, ngram, options, ctx)?;
        let pooled_output = self.pooler.forward(&encoded.last_hidden_state)?;

        Ok(RobertaOutput {
            encoded_layers: encoded.hidden_states,
            sequence_output: encoded.last_hidden_state,
            pooled_output,
            attentions: encoded.attentions,
        })
    }

    /// Backpropagate `loss`, replaying recompute regions when checkpointing.
    ///
    /// The padding row of the N-gram token table gets a zero gradient.
    pub fn backward(&self, loss: &Tensor, params: &[Var]) -> Result<GradStore> {
        let mut grads = self.encoder.backward(loss, params)?;
        if let Some(ngram) = &self.ngram_embeddings {
            ngram.mask_padding_grad(&mut grads)?;
        }
        Ok(grads)
    }

    /// Main embeddings.
    pub fn embeddings(&self) -> &Embeddings {
        &self.embeddings
    }

    /// Encoder stack.
    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Parameter dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
