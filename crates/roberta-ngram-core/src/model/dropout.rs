//! Forward-pass context and dropout.
//!
//! Dropout masks are drawn from a seeded RNG owned by the [`ForwardCtx`],
//! so a recompute region can restore the RNG state it started from and
//! regenerate exactly the same masks during the reverse pass.

use crate::error::Result;
use candle_core::Tensor;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Per-invocation forward state: training flag and dropout RNG.
#[derive(Debug)]
pub struct ForwardCtx {
    train: bool,
    rng: Mutex<StdRng>,
}

impl ForwardCtx {
    /// Training mode with dropout masks drawn from `seed`.
    pub fn train(seed: u64) -> Self {
        Self {
            train: true,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Inference mode; dropout is the identity.
    pub fn eval() -> Self {
        Self {
            train: false,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    /// Whether dropout is active.
    pub fn is_train(&self) -> bool {
        self.train
    }

    /// Copy of the current state; both copies draw the same masks from here on.
    pub fn snapshot(&self) -> Self {
        Self {
            train: self.train,
            rng: Mutex::new(self.rng.lock().clone()),
        }
    }

    fn keep_mask(&self, len: usize, p: f64) -> Vec<f32> {
        let scale = (1.0 / (1.0 - p)) as f32;
        let mut rng = self.rng.lock();
        (0..len)
            .map(|_| if rng.gen::<f64>() < p { 0.0 } else { scale })
            .collect()
    }
}

/// Inverted dropout with probability `p`.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    p: f64,
}

impl Dropout {
    /// Create a dropout layer.
    pub fn new(p: f64) -> Self {
        Self { p }
    }

    /// Drop probability.
    pub fn p(&self) -> f64 {
        self.p
    }

    /// Apply dropout when `ctx` is in training mode.
    pub fn forward(&self, x: &Tensor, ctx: &ForwardCtx) -> Result<Tensor> {
        if !ctx.is_train() || self.p <= 0.0 {
            return Ok(x.clone());
        }
        if self.p >= 1.0 {
            return Ok(x.zeros_like()?);
        }
        let mask = ctx.keep_mask(x.elem_count(), self.p);
        let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
        Ok(x.mul(&mask)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn vals(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn eval_is_identity() {
        let x = Tensor::randn(0.0f32, 1.0, (3, 4), &Device::Cpu).unwrap();
        let y = Dropout::new(0.5).forward(&x, &ForwardCtx::eval()).unwrap();
        assert_eq!(vals(&x), vals(&y));
    }

    #[test]
    fn train_scales_kept_values() {
        let x = Tensor::ones((64, 64), DType::F32, &Device::Cpu).unwrap();
        let y = vals(&Dropout::new(0.25).forward(&x, &ForwardCtx::train(7)).unwrap());
        assert!(y.iter().all(|v| *v == 0.0 || (v - 4.0 / 3.0).abs() < 1e-6));
        let dropped = y.iter().filter(|v| **v == 0.0).count() as f64 / y.len() as f64;
        assert!((dropped - 0.25).abs() < 0.05);
    }

    #[test]
    fn snapshot_replays_same_masks() {
        let x = Tensor::ones((8, 8), DType::F32, &Device::Cpu).unwrap();
        let dropout = Dropout::new(0.5);
        let ctx = ForwardCtx::train(42);
        let replay = ctx.snapshot();

        let first = vals(&dropout.forward(&x, &ctx).unwrap());
        let again = vals(&dropout.forward(&x, &replay).unwrap());
        assert_eq!(first, again);

        // The original context moved on.
        let next = vals(&dropout.forward(&x, &ctx).unwrap());
        assert_ne!(first, next);
    }

    #[test]
    fn full_drop_gives_zeros() {
        let x = Tensor::ones(5, DType::F32, &Device::Cpu).unwrap();
        let y = Dropout::new(1.0).forward(&x, &ForwardCtx::train(0)).unwrap();
        assert_eq!(vals(&y), vec![0.0; 5]);
    }
}
