use candle_core::{DType, Tensor};
use rand::distr::StandardUniform;
use rand::RngCore;
use rand_distr::Distribution as _;

use super::Distribution;
use crate::error::Result;

/// keeps log(p) and log(1-p) finite
const PROB_EPS: f64 = 1e-7;

/// Bernoulli distribution over {0, 1}
///
/// Sampling is not differentiable, so the estimator falls back to the score
/// function term for sites drawn from it.
#[derive(Debug, Clone)]
pub struct Bernoulli {
    probs: Tensor,
}

impl Bernoulli {
    pub fn new(probs: Tensor) -> Self {
        Self { probs }
    }

    /// p = sigmoid(logits)
    pub fn from_logits(logits: &Tensor) -> Result<Self> {
        let probs = candle_nn::ops::sigmoid(logits)?;
        Ok(Self { probs })
    }

    pub fn probs(&self) -> &Tensor {
        &self.probs
    }
}

impl Distribution for Bernoulli {
    fn sample(&self, rng: &mut dyn RngCore) -> Result<Tensor> {
        let probs = self
            .probs
            .detach()
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?;

        let draws: Vec<f64> = probs
            .iter()
            .map(|&p| {
                let u: f64 = StandardUniform.sample(rng);
                if u < p {
                    1.0
                } else {
                    0.0
                }
            })
            .collect();

        let value = Tensor::from_vec(draws, self.probs.dims(), self.probs.device())?;
        Ok(value.to_dtype(self.probs.dtype())?)
    }

    /// log p(x) = x * ln(p) + (1 - x) * ln(1 - p)
    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let probs = self.probs.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
        let ln_p = probs.log()?;
        let ln_q = probs.affine(-1.0, 1.0)?.log()?;
        let one_minus_value = value.affine(-1.0, 1.0)?;
        Ok(value
            .broadcast_mul(&ln_p)?
            .broadcast_add(&one_minus_value.broadcast_mul(&ln_q)?)?)
    }

    fn batch_shape(&self) -> Result<Vec<usize>> {
        Ok(self.probs.dims().to_vec())
    }

    fn has_rsample(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_log_prob() -> Result<()> {
        let device = Device::Cpu;
        let bern = Bernoulli::new(Tensor::new(0.3f64, &device)?);
        let x = Tensor::new(&[1.0f64, 0.0], &device)?;
        let lp = bern.log_prob(&x)?.to_vec1::<f64>()?;
        assert_abs_diff_eq!(lp[0], 0.3f64.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(lp[1], 0.7f64.ln(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_sample_frequency() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(42);
        let probs = Tensor::full(0.25f64, 4000, &device)?;
        let bern = Bernoulli::new(probs);
        let x = bern.sample(&mut rng)?;
        let mean: f64 = x.mean_all()?.to_scalar()?;
        assert_abs_diff_eq!(mean, 0.25, epsilon = 0.03);
        Ok(())
    }

    #[test]
    fn test_score_parts_score_function() -> Result<()> {
        let device = Device::Cpu;
        let bern = Bernoulli::new(Tensor::new(&[0.5f64, 0.5], &device)?);
        let x = Tensor::new(&[1.0f64, 0.0], &device)?;
        let parts = bern.score_parts(&x, 1.0)?;
        assert!(parts.entropy_term.is_none());
        assert_eq!(parts.score_function.expect("score").dims(), &[2]);
        Ok(())
    }
}
