//! Ordered batch payloads.
//!
//! Each task variant accepts its inputs as a positional tensor list. Slot 0
//! carries the batch index tensor and is ignored by the model.
//!
//! | variant | layout |
//! |---|---|
//! | pretraining | `[_, input_ids, attention_mask, token_type_ids, (next_sentence_label, masked_lm_labels)]` |
//! | masked LM | `[_, input_ids, attention_mask, token_type_ids, (masked_lm_labels, (ngram_ids, ngram_attention_mask, ngram_token_type_ids, ngram_position_matrix))]` |
//! | classification | `[_, input_ids, attention_mask, token_type_ids, (labels, (ngram_ids, ngram_attention_mask, ngram_token_type_ids, ngram_position_matrix))]` |

use crate::error::{Result, RobertaError};
use crate::model::{ModelInputs, NgramBatch};
use candle_core::Tensor;

fn check_len(payload: &[Tensor], allowed: &[usize], variant: &str) -> Result<()> {
    if allowed.contains(&payload.len()) {
        Ok(())
    } else {
        Err(RobertaError::MalformedBatch(format!(
            "{variant} payload has {} tensors, expected one of {allowed:?}",
            payload.len()
        )))
    }
}

/// N-gram stream carried in slots 5..9 of a 9-slot payload.
fn ngram_slots(payload: &[Tensor]) -> Option<NgramBatch> {
    match payload {
        [_, _, _, _, _, ids, mask, types, matrix] => Some(NgramBatch {
            input_ids: ids.clone(),
            attention_mask: Some(mask.clone()),
            token_type_ids: Some(types.clone()),
            position_matrix: matrix.clone(),
        }),
        _ => None,
    }
}

/// Joint MLM + next-sentence pretraining batch.
#[derive(Debug, Clone)]
pub struct PretrainingBatch {
    /// Token ids [batch, seq].
    pub input_ids: Tensor,
    /// Padding mask [batch, seq].
    pub attention_mask: Option<Tensor>,
    /// Segment ids [batch, seq].
    pub token_type_ids: Option<Tensor>,
    /// Next-sentence labels [batch] (i64).
    pub next_sentence_label: Option<Tensor>,
    /// Masked-token labels [batch, seq] (i64, -1 = ignore).
    pub masked_lm_labels: Option<Tensor>,
}

impl PretrainingBatch {
    /// Unlabelled batch with default mask and segments.
    pub fn new(input_ids: Tensor) -> Self {
        Self {
            input_ids,
            attention_mask: None,
            token_type_ids: None,
            next_sentence_label: None,
            masked_lm_labels: None,
        }
    }

    /// Parse a 4-slot (unlabelled) or 6-slot (labelled) payload.
    pub fn from_payload(payload: &[Tensor]) -> Result<Self> {
        check_len(payload, &[4, 6], "pretraining")?;
        Ok(Self {
            input_ids: payload[1].clone(),
            attention_mask: Some(payload[2].clone()),
            token_type_ids: Some(payload[3].clone()),
            next_sentence_label: payload.get(4).cloned(),
            masked_lm_labels: payload.get(5).cloned(),
        })
    }

    /// Base model inputs.
    pub fn model_inputs(&self) -> ModelInputs<'_> {
        ModelInputs {
            input_ids: &self.input_ids,
            token_type_ids: self.token_type_ids.as_ref(),
            attention_mask: self.attention_mask.as_ref(),
            ngram: None,
        }
    }
}

/// Masked-LM batch, optionally with the N-gram stream.
#[derive(Debug, Clone)]
pub struct MaskedLmBatch {
    /// Token ids [batch, seq].
    pub input_ids: Tensor,
    /// Padding mask [batch, seq].
    pub attention_mask: Option<Tensor>,
    /// Segment ids [batch, seq].
    pub token_type_ids: Option<Tensor>,
    /// Masked-token labels [batch, seq] (i64, -1 = ignore).
    pub masked_lm_labels: Option<Tensor>,
    /// N-gram stream.
    pub ngram: Option<NgramBatch>,
}

impl MaskedLmBatch {
    /// Unlabelled batch with default mask and segments.
    pub fn new(input_ids: Tensor) -> Self {
        Self {
            input_ids,
            attention_mask: None,
            token_type_ids: None,
            masked_lm_labels: None,
            ngram: None,
        }
    }

    /// Parse a 4-slot (unlabelled), 5-slot (labelled) or 9-slot (labelled
    /// with N-gram stream) payload.
    pub fn from_payload(payload: &[Tensor]) -> Result<Self> {
        check_len(payload, &[4, 5, 9], "masked LM")?;
        Ok(Self {
            input_ids: payload[1].clone(),
            attention_mask: Some(payload[2].clone()),
            token_type_ids: Some(payload[3].clone()),
            masked_lm_labels: payload.get(4).cloned(),
            ngram: ngram_slots(payload),
        })
    }

    /// Base model inputs.
    pub fn model_inputs(&self) -> ModelInputs<'_> {
        ModelInputs {
            input_ids: &self.input_ids,
            token_type_ids: self.token_type_ids.as_ref(),
            attention_mask: self.attention_mask.as_ref(),
            ngram: self.ngram.as_ref(),
        }
    }
}

/// Sequence classification batch.
#[derive(Debug, Clone)]
pub struct ClassificationBatch {
    /// Token ids [batch, seq].
    pub input_ids: Tensor,
    /// Padding mask [batch, seq].
    pub attention_mask: Option<Tensor>,
    /// Segment ids [batch, seq].
    pub token_type_ids: Option<Tensor>,
    /// Class ids (i64) or regression targets (float) [batch].
    pub labels: Option<Tensor>,
    /// N-gram stream; ignored by models built without N-gram fusion.
    pub ngram: Option<NgramBatch>,
}

impl ClassificationBatch {
    /// Unlabelled batch with default mask and segments.
    pub fn new(input_ids: Tensor) -> Self {
        Self {
            input_ids,
            attention_mask: None,
            token_type_ids: None,
            labels: None,
            ngram: None,
        }
    }

    /// Parse a 4-slot (unlabelled), 5-slot (labelled) or 9-slot (labelled
    /// with N-gram stream) payload.
    pub fn from_payload(payload: &[Tensor]) -> Result<Self> {
        check_len(payload, &[4, 5, 9], "classification")?;
        Ok(Self {
            input_ids: payload[1].clone(),
            attention_mask: Some(payload[2].clone()),
            token_type_ids: Some(payload[3].clone()),
            labels: payload.get(4).cloned(),
            ngram: ngram_slots(payload),
        })
    }

    /// Base model inputs.
    pub fn model_inputs(&self) -> ModelInputs<'_> {
        ModelInputs {
            input_ids: &self.input_ids,
            token_type_ids: self.token_type_ids.as_ref(),
            attention_mask: self.attention_mask.as_ref(),
            ngram: self.ngram.as_ref(),
        }
    }
}
