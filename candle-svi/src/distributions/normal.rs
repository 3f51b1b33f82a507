use candle_core::{DType, Device, Shape, Tensor};
use rand::RngCore;
use rand_distr::{Distribution as _, StandardNormal};

use super::{Distribution, LN_2PI};
use crate::error::{Result, SviError};

/// Normal distribution N(loc, scale²), sampled by reparameterization
///
/// `loc` and `scale` broadcast against each other; the batch shape is their
/// broadcast shape.
#[derive(Debug, Clone)]
pub struct Normal {
    loc: Tensor,
    scale: Tensor,
}

impl Normal {
    pub fn new(loc: Tensor, scale: Tensor) -> Result<Self> {
        broadcast_shape(&loc, &scale)?;
        Ok(Self { loc, scale })
    }

    /// Scalar N(loc, scale²) with constant parameters.
    pub fn from_scalars(loc: f64, scale: f64, dtype: DType, device: &Device) -> Result<Self> {
        let loc = Tensor::new(loc, device)?.to_dtype(dtype)?;
        let scale = Tensor::new(scale, device)?.to_dtype(dtype)?;
        Ok(Self { loc, scale })
    }

    pub fn loc(&self) -> &Tensor {
        &self.loc
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }
}

impl Distribution for Normal {
    /// x = loc + scale * ε, ε ~ N(0, 1)
    fn sample(&self, rng: &mut dyn RngCore) -> Result<Tensor> {
        let shape = self.batch_shape()?;
        let n: usize = shape.iter().product();
        let eps: Vec<f64> = (0..n).map(|_| StandardNormal.sample(rng)).collect();
        let eps = Tensor::from_vec(eps, shape, self.loc.device())?.to_dtype(self.loc.dtype())?;
        Ok(self.loc.broadcast_add(&self.scale.broadcast_mul(&eps)?)?)
    }

    /// log N(x; μ, σ²) = -0.5 * [((x-μ)/σ)² + 2*ln(σ) + ln(2π)]
    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let z = value
            .broadcast_sub(&self.loc)?
            .broadcast_div(&self.scale)?;
        let ln_scale = self.scale.log()?;
        let log_prob = (z.sqr()? * (-0.5))?.broadcast_sub(&ln_scale)?;
        Ok((log_prob - 0.5 * LN_2PI)?)
    }

    fn batch_shape(&self) -> Result<Vec<usize>> {
        Ok(broadcast_shape(&self.loc, &self.scale)?.dims().to_vec())
    }

    fn has_rsample(&self) -> bool {
        true
    }
}

fn broadcast_shape(loc: &Tensor, scale: &Tensor) -> Result<Shape> {
    loc.shape()
        .broadcast_shape_binary_op(scale.shape(), "normal")
        .map_err(|_| SviError::IncompatibleShape {
            from: loc.dims().to_vec(),
            to: scale.dims().to_vec(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_log_prob_standard() -> Result<()> {
        let device = Device::Cpu;
        let normal = Normal::from_scalars(0.0, 1.0, DType::F64, &device)?;
        let x = Tensor::new(&[0.0f64, 1.0, -2.0], &device)?;
        let lp = normal.log_prob(&x)?.to_vec1::<f64>()?;

        for (actual, x) in lp.iter().zip([0.0f64, 1.0, -2.0]) {
            assert_abs_diff_eq!(*actual, -0.5 * x * x - 0.5 * LN_2PI, epsilon = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_log_prob_scaled() -> Result<()> {
        let device = Device::Cpu;
        let normal = Normal::from_scalars(1.0, 2.0, DType::F64, &device)?;
        let lp: f64 = normal.log_prob(&Tensor::new(3.0f64, &device)?)?.to_scalar()?;
        let expected = -0.5 - 2f64.ln() - 0.5 * LN_2PI;
        assert_abs_diff_eq!(lp, expected, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_sample_broadcast_shape() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(7);
        let loc = Tensor::zeros((4, 1), DType::F32, &device)?;
        let scale = Tensor::ones(3, DType::F32, &device)?;
        let normal = Normal::new(loc, scale)?;

        assert_eq!(normal.batch_shape()?, vec![4, 3]);
        let x = normal.sample(&mut rng)?;
        assert_eq!(x.dims(), &[4, 3]);
        assert_eq!(x.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_score_parts_reparameterized() -> Result<()> {
        let device = Device::Cpu;
        let normal = Normal::from_scalars(0.0, 1.0, DType::F64, &device)?;
        let x = Tensor::new(0.5f64, &device)?;
        let parts = normal.score_parts(&x, 3.0)?;

        assert!(parts.score_function.is_none());
        let entropy: f64 = parts.entropy_term.expect("entropy").to_scalar()?;
        let log_pdf: f64 = parts.log_pdf.to_scalar()?;
        assert_abs_diff_eq!(entropy, log_pdf);
        assert_abs_diff_eq!(log_pdf, 3.0 * (-0.125 - 0.5 * LN_2PI), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_mismatched_parameters() -> Result<()> {
        let device = Device::Cpu;
        let loc = Tensor::zeros(2, DType::F64, &device)?;
        let scale = Tensor::ones(3, DType::F64, &device)?;
        assert!(matches!(
            Normal::new(loc, scale),
            Err(SviError::IncompatibleShape { .. })
        ));
        Ok(())
    }
}
