//! Recomputation checkpointing.
//!
//! The layer stack is split into contiguous chunks. During the forward pass
//! each chunk runs on a detached copy of its input and only the chunk output
//! is kept, as a fresh leaf [`Var`]. The reverse pass replays the chunks in
//! reverse order, re-running each one from its saved input with the dropout
//! RNG restored, and chains the gradients across the chunk boundaries.

use crate::error::{Result, RobertaError};
use crate::model::ForwardCtx;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use parking_lot::Mutex;
use std::ops::Range;
use tracing::debug;

/// Chunk size for `num_layers` layers: `ceil(sqrt(num_layers))`.
pub fn chunk_size(num_layers: usize) -> usize {
    if num_layers == 0 {
        return 0;
    }
    let mut size = (num_layers as f64).sqrt() as usize;
    while size * size < num_layers {
        size += 1;
    }
    size
}

/// Contiguous layer ranges of at most [`chunk_size`] layers each.
pub fn chunk_ranges(num_layers: usize) -> Vec<Range<usize>> {
    let size = chunk_size(num_layers);
    (0..num_layers)
        .step_by(size.max(1))
        .map(|start| start..(start + size).min(num_layers))
        .collect()
}

/// One recompute region: a chunk of layers and what is needed to re-run it.
#[derive(Debug)]
struct Region {
    layers: Range<usize>,
    /// Detached chunk input.
    input: Tensor,
    bias: Tensor,
    /// Leaf standing in for the chunk output in the outer graph.
    boundary: Var,
    /// Dropout RNG state at chunk entry.
    rng: ForwardCtx,
}

#[derive(Debug)]
struct Recording {
    /// Non-detached input of the first chunk.
    origin: Tensor,
    regions: Vec<Region>,
}

/// Records recompute regions during a forward pass and replays them during
/// [`RecomputeTape::backward`].
///
/// The tape holds at most one recording; a new forward pass replaces it and
/// a backward pass consumes it.
#[derive(Debug, Default)]
pub struct RecomputeTape {
    state: Mutex<Option<Recording>>,
}

impl RecomputeTape {
    /// Create an empty tape.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded regions.
    pub fn len(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |r| r.regions.len())
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the current recording.
    pub fn clear(&self) {
        *self.state.lock() = None;
    }

    /// Run `chunks` over `origin`, keeping only the chunk boundaries.
    ///
    /// `run(layers, input, bias, ctx)` must be a pure function of its
    /// arguments and the parameters; it is called again during the reverse
    /// pass.
    pub fn forward<F>(
        &self,
        origin: &Tensor,
        bias: &Tensor,
        chunks: &[Range<usize>],
        ctx: &ForwardCtx,
        run: F,
    ) -> Result<Tensor>
    where
        F: Fn(Range<usize>, &Tensor, &Tensor, &ForwardCtx) -> Result<Tensor>,
    {
        let mut regions = Vec::with_capacity(chunks.len());
        let mut hidden = origin.clone();
        for layers in chunks {
            let input = hidden.detach();
            let rng = ctx.snapshot();
            let output = run(layers.clone(), &input, bias, ctx)?;
            let boundary = Var::from_tensor(&output)?;
            hidden = boundary.as_tensor().clone();
            regions.push(Region {
                layers: layers.clone(),
                input,
                bias: bias.clone(),
                boundary,
                rng,
            });
        }
        debug!(regions = regions.len(), "recorded recompute regions");
        *self.state.lock() = Some(Recording {
            origin: origin.clone(),
            regions,
        });
        Ok(hidden)
    }

    /// Backpropagate `loss`, replaying the recorded regions.
    ///
    /// Gradients of every var in `params` reached through a region are
    /// accumulated into the returned store. A loss that does not reach the
    /// last recorded boundary is an error, since the encoder gradients would
    /// otherwise be lost.
    pub fn backward<F>(&self, loss: &Tensor, params: &[Var], run: F) -> Result<GradStore>
    where
        F: Fn(Range<usize>, &Tensor, &Tensor, &ForwardCtx) -> Result<Tensor>,
    {
        let mut grads = loss.backward()?;
        let Some(recording) = self.state.lock().take() else {
            return Ok(grads);
        };
        let last = recording
            .regions
            .last()
            .and_then(|region| grads.get(region.boundary.as_tensor()));
        let Some(mut grad_out) = last.cloned() else {
            return Err(RobertaError::IncompatibleOptions(
                "loss does not depend on the recorded forward pass; \
                 a later forward pass replaced it before backward"
                    .to_string(),
            ));
        };

        for region in recording.regions.iter().rev() {
            debug!(layers = ?region.layers, "replaying recompute region");
            let input = Var::from_tensor(&region.input)?;
            let output = run(
                region.layers.clone(),
                input.as_tensor(),
                &region.bias,
                &region.rng.snapshot(),
            )?;
            let local = (output * &grad_out)?.sum_all()?.backward()?;
            accumulate(&mut grads, &local, params)?;
            grad_out = match local.get(input.as_tensor()) {
                Some(grad) => grad.clone(),
                None => return Ok(grads),
            };
        }

        let local = (recording.origin * grad_out)?.sum_all()?.backward()?;
        accumulate(&mut grads, &local, params)?;
        Ok(grads)
    }
}

fn accumulate(into: &mut GradStore, from: &GradStore, params: &[Var]) -> Result<()> {
    for var in params {
        let Some(grad) = from.get(var.as_tensor()) else {
            continue;
        };
        let total = match into.get(var.as_tensor()) {
            Some(prev) => (prev + grad)?,
            None => grad.clone(),
        };
        into.insert(var.as_tensor(), total);
    }
    Ok(())
}
