//! Distributions that can be sampled and scored at trace sites.
//!
//! Every distribution here is elementwise over its batch shape; `log_prob`
//! returns a tensor with the batch dimensions unreduced. Reinterpreting
//! rightmost batch dims as event dims goes through [`Independent`].

mod bernoulli;
mod independent;
mod normal;

pub use bernoulli::Bernoulli;
pub use independent::Independent;
pub use normal::Normal;

use candle_core::Tensor;
use rand::RngCore;

use crate::error::Result;

/// `ln(2π)`
pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Per-site decomposition of the guide log density.
///
/// `None` stands for an identically zero term, which lets the estimator
/// skip it entirely rather than multiplying by zero.
#[derive(Debug, Clone)]
pub struct ScoreParts {
    /// scaled log q(z), batch dims unreduced
    pub log_pdf: Tensor,
    /// term multiplied by the log ratio for non-reparameterized sites
    pub score_function: Option<Tensor>,
    /// term subtracted from the surrogate for reparameterized sites
    pub entropy_term: Option<Tensor>,
}

pub trait Distribution: std::fmt::Debug {
    /// Draw a value with the distribution's batch shape.
    ///
    /// Reparameterized distributions keep the draw on the autodiff graph of
    /// their parameters; the others return a detached tensor.
    fn sample(&self, rng: &mut dyn RngCore) -> Result<Tensor>;

    /// Elementwise log density, shape = broadcast(value, batch shape)
    fn log_prob(&self, value: &Tensor) -> Result<Tensor>;

    fn batch_shape(&self) -> Result<Vec<usize>>;

    /// Whether `sample` is a differentiable transform of the parameters.
    fn has_rsample(&self) -> bool;

    /// Split the scaled log density into its gradient estimator parts.
    ///
    /// * `value` - the recorded site value
    /// * `scale` - subsampling scale of the enclosing plates
    fn score_parts(&self, value: &Tensor, scale: f64) -> Result<ScoreParts> {
        let log_pdf = scale_log_pdf(self.log_prob(value)?, scale)?;
        if self.has_rsample() {
            Ok(ScoreParts {
                entropy_term: Some(log_pdf.clone()),
                score_function: None,
                log_pdf,
            })
        } else {
            Ok(ScoreParts {
                score_function: Some(log_pdf.clone()),
                entropy_term: None,
                log_pdf,
            })
        }
    }
}

pub(crate) fn scale_log_pdf(log_pdf: Tensor, scale: f64) -> Result<Tensor> {
    if scale == 1.0 {
        Ok(log_pdf)
    } else {
        Ok(log_pdf.affine(scale, 0.0)?)
    }
}
