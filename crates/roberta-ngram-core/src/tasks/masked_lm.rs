//! Masked-LM only model, with optional N-gram fusion.

use super::loss::{gather_labels, masked_token_indexes};
use super::MaskedLmBatch;
use crate::encoder::EncoderOptions;
use crate::error::Result;
use crate::heads::LmPredictionHead;
use crate::kernel::KernelProvider;
use crate::model::{ForwardCtx, ModelConfig, RobertaModel};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarBuilder;
use tracing::info;

/// Masked-LM result.
#[derive(Debug, Clone)]
pub struct MaskedLmOutput {
    /// Masked-LM loss, when labels are given.
    pub loss: Option<Tensor>,
    /// `[M, vocab]` masked rows when labelled, `[batch, seq, vocab]` otherwise.
    pub prediction_scores: Tensor,
    /// Per-layer attention probabilities, when requested.
    pub attentions: Option<Vec<Tensor>>,
}

/// Base model with the masked-LM head.
#[derive(Debug)]
pub struct RobertaForMaskedLm {
    roberta: RobertaModel,
    lm_head: LmPredictionHead,
}

impl RobertaForMaskedLm {
    /// Build with parameters under `vb`.
    pub fn new(
        config: &ModelConfig,
        vb: VarBuilder,
        kernels: Option<&dyn KernelProvider>,
    ) -> Result<Self> {
        let roberta = RobertaModel::new(config, vb.pp("roberta"), kernels)?;
        let lm_head = LmPredictionHead::new(
            config,
            roberta.embeddings().word_embeddings(),
            vb.pp("cls").pp("predictions"),
        )?;
        info!(
            layers = config.num_hidden_layers,
            ngram_layers = if config.is_ngram { config.num_hidden_ngram_layers } else { 0 },
            checkpointed = config.checkpoint_activations,
            sparse = config.sparse_mask_prediction,
            "built masked LM model"
        );
        Ok(Self { roberta, lm_head })
    }

    /// Forward pass over a typed batch.
    pub fn forward(
        &self,
        batch: &MaskedLmBatch,
        output_attentions: bool,
        ctx: &ForwardCtx,
    ) -> Result<MaskedLmOutput> {
        let options = EncoderOptions {
            output_all_encoded_layers: false,
            output_attentions,
        };
        let out = self.roberta.forward(batch.model_inputs(), options, ctx)?;

        match &batch.masked_lm_labels {
            Some(labels) => {
                let indexes = masked_token_indexes(labels)?;
                let prediction_scores = self.lm_head.forward(&out.sequence_output, &indexes)?;
                let targets = gather_labels(labels, &indexes)?;
                let loss = candle_nn::loss::cross_entropy(&prediction_scores, &targets)?;
                Ok(MaskedLmOutput {
                    loss: Some(loss),
                    prediction_scores,
                    attentions: out.attentions,
                })
            }
            None => Ok(MaskedLmOutput {
                loss: None,
                prediction_scores: self.lm_head.forward_all(&out.sequence_output)?,
                attentions: out.attentions,
            }),
        }
    }

    /// Forward pass over an ordered payload.
    pub fn forward_payload(
        &self,
        payload: &[Tensor],
        output_attentions: bool,
        ctx: &ForwardCtx,
    ) -> Result<MaskedLmOutput> {
        self.forward(&MaskedLmBatch::from_payload(payload)?, output_attentions, ctx)
    }

    /// Gradients of `loss` for `params`.
    pub fn backward(&self, loss: &Tensor, params: &[Var]) -> Result<GradStore> {
        self.roberta.backward(loss, params)
    }

    /// Base model.
    pub fn roberta(&self) -> &RobertaModel {
        &self.roberta
    }

    /// Masked-LM head.
    pub fn lm_head(&self) -> &LmPredictionHead {
        &self.lm_head
    }
}
