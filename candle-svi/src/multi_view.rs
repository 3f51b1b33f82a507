//! Accumulator for log-density terms living at different batch shapes.
//!
//! Terms of the same shape are added in place. Terms of different shapes
//! are kept apart until [`MultiViewTensor::contract`] reduces them all to a
//! single target shape, so that a term is never broadcast against another
//! one it does not line up with.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::{Result, SviError};

#[derive(Debug, Default, Clone)]
pub struct MultiViewTensor {
    views: BTreeMap<Vec<usize>, Tensor>,
}

impl MultiViewTensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tensor(x: Tensor) -> Result<Self> {
        let mut out = Self::new();
        out.add_tensor(x)?;
        Ok(out)
    }

    /// number of distinct shapes held
    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn shapes(&self) -> impl Iterator<Item = &[usize]> {
        self.views.keys().map(Vec::as_slice)
    }

    /// Add a term to the partial sum of its own shape.
    pub fn add_tensor(&mut self, x: Tensor) -> Result<()> {
        let key = x.dims().to_vec();
        let total = match self.views.remove(&key) {
            Some(total) => (total + x)?,
            None => x,
        };
        self.views.insert(key, total);
        Ok(())
    }

    /// Merge every view of `other` into `self`.
    pub fn add(&mut self, other: MultiViewTensor) -> Result<()> {
        for (_, x) in other.views {
            self.add_tensor(x)?;
        }
        Ok(())
    }

    /// Sum all views into one tensor of exactly `target_shape`.
    ///
    /// Extra leading dims of a view are summed out, then the view is aligned
    /// on the right with `target_shape`. A remaining dim must either match
    /// the target or be singleton; anything else is an error.
    pub fn contract(&self, target_shape: &[usize]) -> Result<Tensor> {
        let mut out: Option<Tensor> = None;

        for (shape, x) in self.views.iter() {
            let x = sum_leftmost_all_but(x, target_shape.len())?;

            let mut aligned = vec![1; target_shape.len() - x.rank()];
            aligned.extend_from_slice(x.dims());

            let compatible = aligned
                .iter()
                .zip(target_shape.iter())
                .all(|(&d, &t)| d == t || d == 1);

            if !compatible {
                return Err(SviError::IncompatibleShape {
                    from: shape.clone(),
                    to: target_shape.to_vec(),
                });
            }

            let x = x.reshape(aligned)?.broadcast_as(target_shape)?;
            out = Some(match out {
                Some(total) => (total + x)?,
                None => x,
            });
        }

        out.ok_or(SviError::EmptyContraction)
    }
}

/// Sum out every dim of `x` except the rightmost `keep`.
pub fn sum_leftmost_all_but(x: &Tensor, keep: usize) -> Result<Tensor> {
    let rank = x.rank();
    if rank <= keep {
        return Ok(x.clone());
    }
    let leading: Vec<usize> = (0..rank - keep).collect();
    Ok(x.sum(leading)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_same_shape_adds_in_place() -> Result<()> {
        let dev = Device::Cpu;
        let mut mv = MultiViewTensor::from_tensor(Tensor::new(&[1f64, 2.0], &dev)?)?;
        mv.add_tensor(Tensor::new(&[10f64, 20.0], &dev)?)?;

        assert_eq!(mv.len(), 1);
        assert_eq!(mv.contract(&[2])?.to_vec1::<f64>()?, vec![11.0, 22.0]);
        Ok(())
    }

    #[test]
    fn test_contract_mixed_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let mut mv = MultiViewTensor::new();
        // scalar, broadcast over the target
        mv.add_tensor(Tensor::new(1f64, &dev)?)?;
        // extra leading dim, summed out
        mv.add_tensor(Tensor::new(&[[1f64, 2.0], [3.0, 4.0], [5.0, 6.0]], &dev)?)?;
        // matching shape
        mv.add_tensor(Tensor::new(&[100f64, 200.0], &dev)?)?;
        assert_eq!(mv.len(), 3);

        let out = mv.contract(&[2])?;
        assert_eq!(out.dims(), &[2]);
        assert_eq!(out.to_vec1::<f64>()?, vec![110.0, 213.0]);
        Ok(())
    }

    #[test]
    fn test_contract_pads_singleton_dims() -> Result<()> {
        let dev = Device::Cpu;
        let mv = MultiViewTensor::from_tensor(Tensor::new(&[1f64, 2.0], &dev)?)?;
        let out = mv.contract(&[3, 2])?;
        assert_eq!(out.dims(), &[3, 2]);
        assert_eq!(out.sum_all()?.to_scalar::<f64>()?, 9.0);
        Ok(())
    }

    #[test]
    fn test_contract_incompatible() -> Result<()> {
        let dev = Device::Cpu;
        let mv = MultiViewTensor::from_tensor(Tensor::new(&[1f64, 2.0, 3.0], &dev)?)?;
        assert!(matches!(
            mv.contract(&[2]),
            Err(SviError::IncompatibleShape { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_contract_empty() {
        assert!(matches!(
            MultiViewTensor::new().contract(&[]),
            Err(SviError::EmptyContraction)
        ));
    }

    #[test]
    fn test_merge_views() -> Result<()> {
        let dev = Device::Cpu;
        let mut lhs = MultiViewTensor::from_tensor(Tensor::new(2f64, &dev)?)?;
        let rhs = MultiViewTensor::from_tensor(Tensor::new(&[1f64, 1.0], &dev)?)?;
        lhs.add(rhs)?;

        assert_eq!(lhs.shapes().count(), 2);
        assert_eq!(lhs.contract(&[])?.to_scalar::<f64>()?, 4.0);
        Ok(())
    }

    #[test]
    fn test_sum_leftmost_all_but() -> Result<()> {
        let x = Tensor::ones((4, 3, 2), candle_core::DType::F64, &Device::Cpu)?;
        assert_eq!(sum_leftmost_all_but(&x, 1)?.dims(), &[2]);
        assert_eq!(sum_leftmost_all_but(&x, 3)?.dims(), &[4, 3, 2]);
        assert_eq!(sum_leftmost_all_but(&x, 0)?.dims(), &[] as &[usize]);
        Ok(())
    }
}
