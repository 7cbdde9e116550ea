//! N-gram fusion example.
//!
//! Builds a masked-LM model with the N-gram stream enabled and shows how the
//! position matrix maps N-gram states onto the tokens they cover.

use anyhow::Result;
use candle_core::{Device, Tensor};
use roberta_ngram::prelude::*;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = ModelConfig {
        vocab_size: 100,
        hidden_size: 32,
        num_hidden_layers: 3,
        num_attention_heads: 4,
        intermediate_size: 64,
        max_position_embeddings: 16,
        is_ngram: true,
        ngram_vocab_size: 50,
        num_hidden_ngram_layers: 2,
        ..ModelConfig::default()
    };
    let built = ModelBuilder::new()
        .model_config(config)
        .build_masked_lm()?;

    let device = Device::Cpu;
    let input_ids = Tensor::new(&[[0u32, 11, 12, 13, 14, 2]], &device)?;

    // Two N-grams: tokens 1..=2 and tokens 2..=4.
    let mut matrix = vec![0f32; 6 * 2];
    for token in 1..=2 {
        matrix[token * 2] = 1.0;
    }
    for token in 2..=4 {
        matrix[token * 2 + 1] = 1.0;
    }
    let ngram = NgramBatch {
        input_ids: Tensor::new(&[[7u32, 23]], &device)?,
        attention_mask: None,
        token_type_ids: None,
        position_matrix: Tensor::from_vec(matrix, (1, 6, 2), &device)?,
    };

    let batch = MaskedLmBatch {
        masked_lm_labels: Some(Tensor::new(&[[-1i64, -1, 12, -1, -1, -1]], &device)?),
        ngram: Some(ngram),
        ..MaskedLmBatch::new(input_ids)
    };

    let out = built.model.forward(&batch, true, &ForwardCtx::eval())?;
    if let Some(loss) = &out.loss {
        println!("masked LM loss: {:.4}", loss.to_scalar::<f32>()?);
    }
    println!("masked rows: {:?}", out.prediction_scores.dims());
    if let Some(attentions) = &out.attentions {
        println!("recorded {} attention maps", attentions.len());
    }

    let plain = MaskedLmBatch {
        ngram: None,
        ..batch.clone()
    };
    match built.model.forward(&plain, false, &ForwardCtx::eval()) {
        Err(RobertaError::MissingInput(msg)) => println!("without N-grams: {msg}"),
        other => println!("unexpected: {:?}", other.map(|o| o.prediction_scores.dims().to_vec())),
    }

    Ok(())
}
