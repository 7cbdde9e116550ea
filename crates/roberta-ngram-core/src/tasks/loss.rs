//! Loss helpers shared by the task variants.

use crate::error::{Result, RobertaError};
use candle_core::{DType, Tensor};

/// Label value excluded from every loss.
pub const IGNORE_INDEX: i64 = -1;

/// Flat positions of `labels` holding a real label, in row-major order.
///
/// Returns a `[M]` u32 tensor on the labels' device; an all-ignored label
/// tensor is [`RobertaError::NoTargets`].
pub fn masked_token_indexes(labels: &Tensor) -> Result<Tensor> {
    let flat: Vec<i64> = labels.flatten_all()?.to_dtype(DType::I64)?.to_vec1()?;
    let indexes: Vec<u32> = flat
        .iter()
        .enumerate()
        .filter(|(_, label)| **label != IGNORE_INDEX)
        .map(|(i, _)| i as u32)
        .collect();
    if indexes.is_empty() {
        return Err(RobertaError::NoTargets);
    }
    let len = indexes.len();
    Ok(Tensor::from_vec(indexes, len, labels.device())?)
}

/// Labels at `indexes` of the flattened `labels`, as u32 class ids.
pub fn gather_labels(labels: &Tensor, indexes: &Tensor) -> Result<Tensor> {
    Ok(labels
        .flatten_all()?
        .index_select(indexes, 0)?
        .to_dtype(DType::U32)?)
}

/// Cross-entropy over the rows of `logits` [N, C] whose label is not
/// [`IGNORE_INDEX`].
pub fn cross_entropy_ignoring(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let indexes = masked_token_indexes(labels)?;
    let logits = logits.index_select(&indexes, 0)?;
    let targets = gather_labels(labels, &indexes)?;
    Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
}

/// Loss used by a classification head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    /// Mean squared error on a single regression output.
    SquaredError,
    /// Cross-entropy over the label classes.
    CrossEntropy,
}

impl LossKind {
    /// Squared error for a single output, cross-entropy otherwise.
    pub fn for_num_labels(num_labels: usize) -> Self {
        if num_labels == 1 {
            Self::SquaredError
        } else {
            Self::CrossEntropy
        }
    }

    /// Loss of `logits` [batch, num_labels] against `labels` [batch].
    pub fn compute(self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        match self {
            Self::SquaredError => {
                let targets = labels.flatten_all()?.to_dtype(logits.dtype())?;
                Ok(candle_nn::loss::mse(&logits.flatten_all()?, &targets)?)
            }
            Self::CrossEntropy => {
                let targets = labels.flatten_all()?.to_dtype(DType::U32)?;
                Ok(candle_nn::loss::cross_entropy(logits, &targets)?)
            }
        }
    }
}
