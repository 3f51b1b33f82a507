use candle_core::Tensor;
use rand::RngCore;

use super::Distribution;
use crate::error::{Result, SviError};

/// Reinterprets the rightmost `reinterpreted` batch dims of `base` as event
/// dims, summing them out of the log density.
#[derive(Debug)]
pub struct Independent {
    base: Box<dyn Distribution>,
    reinterpreted: usize,
}

impl Independent {
    pub fn new<D: Distribution + 'static>(base: D, reinterpreted: usize) -> Result<Self> {
        let rank = base.batch_shape()?.len();
        if reinterpreted > rank {
            return Err(SviError::InvalidConfig(format!(
                "cannot reinterpret {} dims of a batch of rank {}",
                reinterpreted, rank
            )));
        }
        Ok(Self {
            base: Box::new(base),
            reinterpreted,
        })
    }
}

impl Distribution for Independent {
    fn sample(&self, rng: &mut dyn RngCore) -> Result<Tensor> {
        self.base.sample(rng)
    }

    fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let mut log_prob = self.base.log_prob(value)?;
        for _ in 0..self.reinterpreted {
            log_prob = log_prob.sum(log_prob.rank() - 1)?;
        }
        Ok(log_prob)
    }

    fn batch_shape(&self) -> Result<Vec<usize>> {
        let shape = self.base.batch_shape()?;
        Ok(shape[..shape.len() - self.reinterpreted].to_vec())
    }

    fn has_rsample(&self) -> bool {
        self.base.has_rsample()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Normal;
    use candle_core::{DType, Device};

    #[test]
    fn test_event_dims_summed() -> Result<()> {
        let device = Device::Cpu;
        let loc = Tensor::zeros((2, 3), DType::F64, &device)?;
        let scale = Tensor::ones((2, 3), DType::F64, &device)?;
        let normal = Normal::new(loc, scale)?;
        let per_elem = normal.log_prob(&Tensor::zeros((2, 3), DType::F64, &device)?)?;

        let indep = Independent::new(normal, 1)?;
        assert_eq!(indep.batch_shape()?, vec![2]);

        let x = Tensor::zeros((2, 3), DType::F64, &device)?;
        let lp = indep.log_prob(&x)?;
        assert_eq!(lp.dims(), &[2]);

        let expected = per_elem.sum(1)?.to_vec1::<f64>()?;
        assert_eq!(lp.to_vec1::<f64>()?, expected);
        Ok(())
    }

    #[test]
    fn test_too_many_event_dims() -> Result<()> {
        let device = Device::Cpu;
        let normal = Normal::from_scalars(0.0, 1.0, DType::F64, &device)?;
        assert!(Independent::new(normal, 1).is_err());
        Ok(())
    }
}
