//! Joint masked-LM + next-sentence pretraining.

use super::loss::{cross_entropy_ignoring, gather_labels, masked_token_indexes};
use super::PretrainingBatch;
use crate::encoder::EncoderOptions;
use crate::error::{Result, RobertaError};
use crate::heads::{LmPredictionHead, NspHead};
use crate::kernel::KernelProvider;
use crate::model::{ForwardCtx, ModelConfig, RobertaModel};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarBuilder;
use tracing::info;

/// Pretraining result.
#[derive(Debug, Clone)]
pub struct PretrainingOutput {
    /// Masked-LM loss plus next-sentence loss, when labels are given.
    pub loss: Option<Tensor>,
    /// `[M, vocab]` masked rows when labelled, `[batch, seq, vocab]` otherwise.
    pub prediction_scores: Tensor,
    /// Next-sentence logits [batch, 2].
    pub seq_relationship_score: Tensor,
}

/// Base model with the masked-LM and next-sentence heads.
#[derive(Debug)]
pub struct RobertaForPreTraining {
    roberta: RobertaModel,
    lm_head: LmPredictionHead,
    nsp_head: NspHead,
}

impl RobertaForPreTraining {
    /// Build with parameters under `vb`.
    pub fn new(
        config: &ModelConfig,
        vb: VarBuilder,
        kernels: Option<&dyn KernelProvider>,
    ) -> Result<Self> {
        let roberta = RobertaModel::new(config, vb.pp("roberta"), kernels)?;
        let cls = vb.pp("cls");
        let lm_head = LmPredictionHead::new(
            config,
            roberta.embeddings().word_embeddings(),
            cls.pp("predictions"),
        )?;
        let nsp_head = NspHead::new(config, cls)?;
        info!(
            layers = config.num_hidden_layers,
            checkpointed = config.checkpoint_activations,
            sparse = config.sparse_mask_prediction,
            "built pretraining model"
        );
        Ok(Self {
            roberta,
            lm_head,
            nsp_head,
        })
    }

    /// Forward pass over a typed batch.
    pub fn forward(&self, batch: &PretrainingBatch, ctx: &ForwardCtx) -> Result<PretrainingOutput> {
        let out = self
            .roberta
            .forward(batch.model_inputs(), EncoderOptions::default(), ctx)?;
        let seq_relationship_score = self.nsp_head.forward(&out.pooled_output)?;

        match (&batch.masked_lm_labels, &batch.next_sentence_label) {
            (Some(mlm_labels), Some(nsp_labels)) => {
                let indexes = masked_token_indexes(mlm_labels)?;
                let prediction_scores = self.lm_head.forward(&out.sequence_output, &indexes)?;
                let targets = gather_labels(mlm_labels, &indexes)?;
                let mlm_loss = candle_nn::loss::cross_entropy(&prediction_scores, &targets)?;
                let nsp_loss = cross_entropy_ignoring(&seq_relationship_score, nsp_labels)?;
                Ok(PretrainingOutput {
                    loss: Some((mlm_loss + nsp_loss)?),
                    prediction_scores,
                    seq_relationship_score,
                })
            }
            (None, None) => Ok(PretrainingOutput {
                loss: None,
                prediction_scores: self.lm_head.forward_all(&out.sequence_output)?,
                seq_relationship_score,
            }),
            _ => Err(RobertaError::MalformedBatch(
                "pretraining needs both masked-LM and next-sentence labels, or neither"
                    .to_string(),
            )),
        }
    }

    /// Forward pass over an ordered payload.
    pub fn forward_payload(&self, payload: &[Tensor], ctx: &ForwardCtx) -> Result<PretrainingOutput> {
        self.forward(&PretrainingBatch::from_payload(payload)?, ctx)
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
