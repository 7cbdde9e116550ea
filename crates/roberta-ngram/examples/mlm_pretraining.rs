//! Masked-LM + next-sentence pretraining example.
//!
//! Runs a few SGD steps on a synthetic batch with activation checkpointing
//! enabled, so every backward pass replays the recompute regions.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, SGD};
use roberta_ngram::prelude::*;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = ModelConfig {
        vocab_size: 128,
        hidden_size: 64,
        num_hidden_layers: 5,
        num_attention_heads: 4,
        intermediate_size: 128,
        max_position_embeddings: 32,
        checkpoint_activations: true,
        ..ModelConfig::default()
    };
    let built = ModelBuilder::new()
        .model_config(config)
        .build_pretraining()?;
    println!(
        "Built pretraining model with {} parameter tensors",
        built.params.len()
    );

    let device = Device::Cpu;
    let payload = vec![
        Tensor::new(&[0u32, 1], &device)?,
        Tensor::new(&[[0u32, 17, 42, 9, 33, 2], [0, 71, 5, 2, 1, 1]], &device)?,
        Tensor::new(&[[1u32, 1, 1, 1, 1, 1], [1, 1, 1, 1, 0, 0]], &device)?,
        Tensor::zeros((2, 6), DType::U32, &device)?,
        Tensor::new(&[1i64, 0], &device)?,
        Tensor::new(&[[-1i64, 20, -1, -1, 8, -1], [-1, -1, 64, -1, -1, -1]], &device)?,
    ];

    let mut sgd = SGD::new(built.params.all_vars(), 0.05)?;
    for step in 0..5 {
        let ctx = ForwardCtx::train(step);
        let out = built.model.forward_payload(&payload, &ctx)?;
        let Some(loss) = out.loss else {
            anyhow::bail!("labelled payload produced no loss");
        };
        let grads = built.model.backward(&loss, &built.params.all_vars())?;
        sgd.step(&grads)?;
        println!("step {step}: loss = {:.4}", loss.to_scalar::<f32>()?);
    }

    // Unlabelled payload: full per-position logits.
    let out = built
        .model
        .forward_payload(&payload[..4], &ForwardCtx::eval())?;
    println!("prediction scores: {:?}", out.prediction_scores.dims());
    println!("next-sentence scores: {:?}", out.seq_relationship_score.dims());

    Ok(())
}
