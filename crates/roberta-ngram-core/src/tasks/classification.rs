//! Sequence classification and regression.

use super::loss::LossKind;
use super::ClassificationBatch;
use crate::encoder::EncoderOptions;
use crate::error::Result;
use crate::kernel::KernelProvider;
use crate::model::{linear, Dropout, ForwardCtx, ModelConfig, RobertaModel};
use candle_core::backprop::GradStore;
use candle_core::{Module, Tensor, Var};
use candle_nn::{Linear, VarBuilder};
use tracing::info;

/// Classification result.
#[derive(Debug, Clone)]
pub struct SequenceClassifierOutput {
    /// Loss, when labels are given.
    pub loss: Option<Tensor>,
    /// Logits [batch, num_labels].
    pub logits: Tensor,
    /// Never populated by this head.
    pub hidden_states: Option<Vec<Tensor>>,
    /// Never populated by this head.
    pub attentions: Option<Vec<Tensor>>,
}

/// Base model with a dropout + dense classifier over the pooled output.
#[derive(Debug)]
pub struct RobertaForSequenceClassification {
    roberta: RobertaModel,
    dropout: Dropout,
    classifier: Linear,
    loss_kind: LossKind,
}

impl RobertaForSequenceClassification {
    /// Build with parameters under `vb`.
    pub fn new(
        config: &ModelConfig,
        vb: VarBuilder,
        kernels: Option<&dyn KernelProvider>,
    ) -> Result<Self> {
        let roberta = RobertaModel::new(config, vb.pp("roberta"), kernels)?;
        let classifier = linear(
            config.hidden_size,
            config.num_labels,
            config.initializer_range,
            vb.pp("classifier"),
        )?;
        let loss_kind = LossKind::for_num_labels(config.num_labels);
        info!(
            num_labels = config.num_labels,
            loss = ?loss_kind,
            "built sequence classification model"
        );
        Ok(Self {
            roberta,
            dropout: Dropout::new(config.hidden_dropout_prob),
            classifier,
            loss_kind,
        })
    }

    /// Forward pass over a typed batch.
    pub fn forward(
        &self,
        batch: &ClassificationBatch,
        ctx: &ForwardCtx,
    ) -> Result<SequenceClassifierOutput> {
        let out = self
            .roberta
            .forward(batch.model_inputs(), EncoderOptions::default(), ctx)?;
        let pooled = self.dropout.forward(&out.pooled_output, ctx)?;
        let logits = self.classifier.forward(&pooled)?;
        let loss = match &batch.labels {
            Some(labels) => Some(self.loss_kind.compute(&logits, labels)?),
            None => None,
        };
        Ok(SequenceClassifierOutput {
            loss,
            logits,
            hidden_states: None,
            attentions: None,
        })
    }

    /// Forward pass over an ordered payload.
    pub fn forward_payload(
        &self,
        payload: &[Tensor],
        ctx: &ForwardCtx,
    ) -> Result<SequenceClassifierOutput> {
        self.forward(&ClassificationBatch::from_payload(payload)?, ctx)
    }

    /// Gradients of `loss` for `params`.
    pub fn backward(&self, loss: &Tensor, params: &[Var]) -> Result<GradStore> {
        self.roberta.backward(loss, params)
    }

    /// Loss chosen from the label count.
    pub fn loss_kind(&self) -> LossKind {
        self.loss_kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RobertaError;
    use crate::model::NgramBatch;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(num_labels: usize) -> RobertaForSequenceClassification {
        let config = ModelConfig {
            num_labels,
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        RobertaForSequenceClassification::new(&config, vb, None).unwrap()
    }

    fn ids() -> Tensor {
        Tensor::new(&[[0u32, 8, 9, 2], [0, 10, 2, 1]], &Device::Cpu).unwrap()
    }

    #[test]
    fn single_label_is_regression() {
        let model = build(1);
        assert_eq!(model.loss_kind(), LossKind::SquaredError);

        let batch = ClassificationBatch {
            labels: Some(Tensor::new(&[0.5f32, -1.0], &Device::Cpu).unwrap()),
            ..ClassificationBatch::new(ids())
        };
        let out = model.forward(&batch, &ForwardCtx::eval()).unwrap();
        assert_eq!(out.logits.dims(), &[2, 1]);

        let logits: Vec<f32> = out.logits.flatten_all().unwrap().to_vec1().unwrap();
        let expected = ((logits[0] - 0.5).powi(2) + (logits[1] + 1.0).powi(2)) / 2.0;
        let loss: f32 = out.loss.unwrap().to_scalar().unwrap();
        assert!((loss - expected).abs() < 1e-5);
        assert!(out.hidden_states.is_none());
        assert!(out.attentions.is_none());
    }

    #[test]
    fn three_labels_use_cross_entropy() {
        let model = build(3);
        assert_eq!(model.loss_kind(), LossKind::CrossEntropy);

        let labels = Tensor::new(&[2i64, 0], &Device::Cpu).unwrap();
        let batch = ClassificationBatch {
            labels: Some(labels),
            ..ClassificationBatch::new(ids())
        };
        let out = model.forward(&batch, &ForwardCtx::eval()).unwrap();
        assert_eq!(out.logits.dims(), &[2, 3]);

        let targets = Tensor::new(&[2u32, 0], &Device::Cpu).unwrap();
        let expected: f32 = candle_nn::loss::cross_entropy(&out.logits, &targets)
            .unwrap()
            .to_scalar()
            .unwrap();
        let loss: f32 = out.loss.unwrap().to_scalar().unwrap();
        assert!((loss - expected).abs() < 1e-6);
    }

    #[test]
    fn unlabelled_forward_has_no_loss() {
        let model = build(2);
        let out = model
            .forward(&ClassificationBatch::new(ids()), &ForwardCtx::eval())
            .unwrap();
        assert!(out.loss.is_none());
        assert_eq!(out.logits.dims(), &[2, 2]);
    }

    fn ngram_batch() -> NgramBatch {
        let device = Device::Cpu;
        NgramBatch {
            input_ids: Tensor::new(&[[5u32, 6, 7], [8, 9, 1]], &device).unwrap(),
            attention_mask: Some(Tensor::new(&[[1u32, 1, 1], [1, 1, 0]], &device).unwrap()),
            token_type_ids: None,
            position_matrix: Tensor::new(
                &[
                    [[0.0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                    [[0.0, 0.0, 0.0], [1.0, 1.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
                ],
                &device,
            )
            .unwrap(),
        }
    }

    #[test]
    fn ngram_stream_reaches_classifier() {
        let config = ModelConfig {
            is_ngram: true,
            num_labels: 3,
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = RobertaForSequenceClassification::new(&config, vb, None).unwrap();

        assert!(matches!(
            model.forward(&ClassificationBatch::new(ids()), &ForwardCtx::eval()),
            Err(RobertaError::MissingInput(_))
        ));

        let batch = ClassificationBatch {
            labels: Some(Tensor::new(&[1i64, 2], &Device::Cpu).unwrap()),
            ngram: Some(ngram_batch()),
            ..ClassificationBatch::new(ids())
        };
        let out = model.forward(&batch, &ForwardCtx::eval()).unwrap();
        assert_eq!(out.logits.dims(), &[2, 3]);
        assert!(out.loss.is_some());
    }

    #[test]
    fn ngram_payload_is_ignored_without_fusion() {
        let model = build(2);
        let device = Device::Cpu;
        let ngram = ngram_batch();
        let payload = vec![
            Tensor::new(&[0u32, 1], &device).unwrap(),
            ids(),
            Tensor::ones((2, 4), DType::U32, &device).unwrap(),
            Tensor::zeros((2, 4), DType::U32, &device).unwrap(),
            Tensor::new(&[1i64, 0], &device).unwrap(),
            ngram.input_ids.clone(),
            ngram.attention_mask.clone().unwrap(),
            Tensor::zeros((2, 3), DType::U32, &device).unwrap(),
            ngram.position_matrix.clone(),
        ];
        let with = model.forward_payload(&payload, &ForwardCtx::eval()).unwrap();
        let without = model
            .forward_payload(&payload[..5], &ForwardCtx::eval())
            .unwrap();
        let a: Vec<f32> = with.logits.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = without.logits.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }
}
