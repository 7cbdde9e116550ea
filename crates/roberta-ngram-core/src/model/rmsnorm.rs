//! Root Mean Square Layer Normalization.
//!
//! RMSNorm is a simpler alternative to LayerNorm that only
//! normalizes by the root mean square, without centering.
//!
//! # Formula
//!
//! `RMSNorm(x) = scale * x / (rms(x[..k]) + eps) [+ offset]`
//!
//! where `rms(v) = ||v||_2 / sqrt(len(v))` and `k` is either the full last
//! axis or, for partial RMSNorm, the first `floor(dim * p)` channels.
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::{Result, RobertaError};
use candle_core::{Tensor, D};
use candle_nn::{Init, VarBuilder};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    scale: Tensor,
    /// Optional learnable shift.
    offset: Option<Tensor>,
    /// Small constant for numerical stability.
    eps: f64,
    /// Hidden dimension.
    hidden_size: usize,
    /// Channels the statistic is computed over.
    partial_size: usize,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with parameters under `vb`.
    ///
    /// A `partial_fraction` outside `[0, 1]` uses the whole last axis.
    pub fn new(
        hidden_size: usize,
        partial_fraction: f64,
        eps: f64,
        has_bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let partial_size = Self::partial_size(hidden_size, partial_fraction);
        if partial_size == 0 {
            return Err(RobertaError::Config(format!(
                "partial fraction {partial_fraction} selects no channels of {hidden_size}"
            )));
        }
        let scale = vb.get_with_hints(hidden_size, "scale", Init::Const(1.0))?;
        let offset = if has_bias {
            Some(vb.get_with_hints(hidden_size, "offset", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self {
            scale,
            offset,
            eps,
            hidden_size,
            partial_size,
        })
    }

    fn partial_size(hidden_size: usize, p: f64) -> usize {
        if (0.0..=1.0).contains(&p) {
            (hidden_size as f64 * p) as usize
        } else {
            hidden_size
        }
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let slice = if self.partial_size == self.hidden_size {
            x.clone()
        } else {
            x.narrow(D::Minus1, 0, self.partial_size)?
        };

        // ||x||_2 / sqrt(d)
        let norm = slice.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
        let rms = (norm * (self.partial_size as f64).powf(-0.5))?;

        let normed = x.broadcast_div(&(rms + self.eps)?)?;
        let output = normed.broadcast_mul(&self.scale)?;

        match &self.offset {
            Some(offset) => Ok(output.broadcast_add(offset)?),
            None => Ok(output),
        }
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Number of channels the statistic is computed over.
    pub fn stat_channels(&self) -> usize {
        self.partial_size
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn create_test_rmsnorm(hidden_size: usize, p: f64) -> RmsNorm {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        RmsNorm::new(hidden_size, p, 1e-8, false, vb).unwrap()
    }

    fn vals(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn rmsnorm_creation() {
        let norm = create_test_rmsnorm(64, -1.0);
        assert_eq!(norm.hidden_size(), 64);
        assert_eq!(norm.stat_channels(), 64);
        assert!((norm.eps() - 1e-8).abs() < 1e-15);
    }

    #[test]
    fn rmsnorm_forward_3d() {
        let norm = create_test_rmsnorm(64, -1.0);

        // [batch, seq, hidden]
        let x = Tensor::randn(0.0f32, 1.0, &[2, 16, 64], &Device::Cpu).unwrap();
        let output = norm.forward(&x).unwrap();

        assert_eq!(output.dims(), x.dims());
    }

    #[test]
    fn rmsnorm_normalized_magnitude() {
        let norm = create_test_rmsnorm(64, -1.0);

        // All values = 2.0, so rms = 2.0 and output = 1.0
        let x = (Tensor::ones(&[1, 64], DType::F32, &Device::Cpu).unwrap() * 2.0).unwrap();
        let output = norm.forward(&x).unwrap();

        for val in vals(&output) {
            assert!((val - 1.0).abs() < 1e-4, "Expected ~1.0, got {}", val);
        }
    }

    #[test]
    fn partial_statistic_uses_prefix() {
        let norm = create_test_rmsnorm(4, 0.5);
        assert_eq!(norm.stat_channels(), 2);

        // rms over [3, 4] = sqrt(12.5)
        let x = Tensor::new(&[[3.0f32, 4.0, 100.0, -100.0]], &Device::Cpu).unwrap();
        let out = vals(&norm.forward(&x).unwrap());
        let rms = 12.5f32.sqrt();
        assert!((out[0] - 3.0 / rms).abs() < 1e-5);
        assert!((out[2] - 100.0 / rms).abs() < 1e-3);
    }

    #[test]
    fn out_of_range_fraction_uses_full_axis() {
        let x = Tensor::randn(0.0f32, 1.0, &[3, 5, 8], &Device::Cpu).unwrap();
        let full = vals(&create_test_rmsnorm(8, 1.0).forward(&x).unwrap());

        for p in [1.5, -0.2, -1.0, 7.0] {
            let norm = create_test_rmsnorm(8, p);
            assert_eq!(norm.stat_channels(), 8);
            let out = vals(&norm.forward(&x).unwrap());
            for (a, b) in out.iter().zip(full.iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn empty_partial_slice_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(RmsNorm::new(8, 0.1, 1e-8, false, vb).is_err());
    }

    #[test]
    fn offset_is_added() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = RmsNorm::new(4, -1.0, 1e-8, true, vb).unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .get("offset")
            .unwrap()
            .set(&Tensor::new(&[1.0f32, 1.0, 1.0, 1.0], &Device::Cpu).unwrap())
            .unwrap();

        let x = Tensor::new(&[[2.0f32, 2.0, 2.0, 2.0]], &Device::Cpu).unwrap();
        for val in vals(&norm.forward(&x).unwrap()) {
            assert!((val - 2.0).abs() < 1e-5);
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use proptest::prelude::*;

    proptest! {
        /// Invariant: any fraction outside [0, 1] behaves like the full axis.
        #[test]
        fn invariant_out_of_range_is_full_axis(
            p in prop_oneof![-10.0f64..-0.0001, 1.0001f64..10.0],
            seed in 0u64..1000,
        ) {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let full = RmsNorm::new(6, 1.0, 1e-8, false, vb.pp("a")).unwrap();
            let other = RmsNorm::new(6, p, 1e-8, false, vb.pp("b")).unwrap();

            let data: Vec<f32> = (0..12).map(|i| ((i as u64 * 31 + seed) % 17) as f32 - 8.0).collect();
            let x = Tensor::from_vec(data, (2, 6), &Device::Cpu).unwrap();
            let a: Vec<f32> = full.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = other.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
            for (u, v) in a.iter().zip(b.iter()) {
                prop_assert!((u - v).abs() < 1e-5);
            }
        }
    }
}
