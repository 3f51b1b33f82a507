//! Monte-Carlo ELBO estimation over model/guide trace pairs.
//!
//! For each particle the guide is traced and the model is replayed on the
//! guide's sampled values. Reparameterized guide sites contribute pathwise
//! gradients through the model log density and their entropy term;
//! non-reparameterized sites contribute a score-function term weighted by a
//! detached log ratio restricted to the plates the site shares with the
//! rest of the model.

mod site_log_r;
mod trace_pairs;

pub use site_log_r::compute_site_log_r;
pub use trace_pairs::TracePairs;

use std::collections::BTreeSet;

use candle_core::Tensor;
use log::{debug, warn};
use rand::RngCore;

use crate::error::{Result, SviError};
use crate::param_store::ParamStore;
use crate::trace::{is_nan, scalar_value, Program, Site};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElboConfig {
    /// number of trace pairs averaged per estimate
    pub num_particles: usize,
    /// number of rightmost batch dims reserved for plates
    pub max_plate_nesting: usize,
}

impl Default for ElboConfig {
    fn default() -> Self {
        Self {
            num_particles: 1,
            max_plate_nesting: usize::MAX,
        }
    }
}

impl ElboConfig {
    pub fn new(num_particles: usize, max_plate_nesting: usize) -> Result<Self> {
        let config = Self {
            num_particles,
            max_plate_nesting,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(SviError::InvalidConfig(
                "num_particles must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trace-based ELBO estimator.
#[derive(Debug, Clone)]
pub struct TraceElbo {
    config: ElboConfig,
}

impl TraceElbo {
    pub fn new(config: ElboConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ElboConfig {
        &self.config
    }

    /// One `(model_trace, guide_trace)` pair per particle, generated lazily.
    pub fn traces<'a, M, G>(
        &self,
        model: &'a M,
        guide: &'a G,
        params: &'a ParamStore,
        rng: &'a mut dyn RngCore,
    ) -> TracePairs<'a, M, G>
    where
        M: Program + ?Sized,
        G: Program + ?Sized,
    {
        TracePairs::new(model, guide, params, rng, &self.config)
    }

    /// Estimate of the negative ELBO, without gradients.
    pub fn loss<M, G>(
        &self,
        model: &M,
        guide: &G,
        params: &ParamStore,
        rng: &mut dyn RngCore,
    ) -> Result<f64>
    where
        M: Program + ?Sized,
        G: Program + ?Sized,
    {
        let num_particles = self.config.num_particles as f64;
        let mut elbo = 0.0;
        for pair in self.traces(model, guide, params, rng) {
            let (model_trace, guide_trace) = pair?;
            let elbo_particle = model_trace.log_pdf()? - guide_trace.log_pdf()?;
            elbo += elbo_particle / num_particles;
        }

        let loss = -elbo;
        if is_nan(loss) {
            warn!("Encountered NaN loss");
        }
        Ok(loss)
    }

    /// Estimate of the negative ELBO; also runs one backward pass per
    /// particle on the surrogate objective and accumulates the resulting
    /// gradients in `params`.
    ///
    /// Parameters read by either program are marked active in `params` for
    /// every particle whose surrogate depends on some variable. Gradients
    /// add up across calls until [`ParamStore::reset`].
    pub fn loss_and_grads<M, G>(
        &self,
        model: &M,
        guide: &G,
        params: &ParamStore,
        rng: &mut dyn RngCore,
    ) -> Result<f64>
    where
        M: Program + ?Sized,
        G: Program + ?Sized,
    {
        let num_particles = self.config.num_particles as f64;
        let mut elbo = 0.0;

        for (particle, pair) in self.traces(model, guide, params, rng).enumerate() {
            let (model_trace, guide_trace) = pair?;
            let mut elbo_particle = 0.0;
            let mut surrogate: Option<Tensor> = None;

            for model_site in model_trace.iter() {
                let Some(model_sample) = model_site.as_sample() else {
                    continue;
                };
                let model_log_pdf = model_sample.log_pdf()?;

                if model_site.is_observed() {
                    elbo_particle += scalar_value(model_log_pdf)?;
                    surrogate = accumulate(surrogate, model_log_pdf.clone())?;
                    continue;
                }

                let name = model_sample.name();
                let guide_sample = guide_trace
                    .get(name)
                    .and_then(Site::as_sample)
                    .ok_or_else(|| SviError::UnknownSite(name.to_string()))?;
                let parts = guide_sample.score_parts()?;

                elbo_particle +=
                    scalar_value(model_log_pdf)? - scalar_value(&parts.log_pdf.sum_all()?)?;
                surrogate = accumulate(surrogate, model_log_pdf.clone())?;

                if let Some(entropy_term) = parts.entropy_term.as_ref() {
                    surrogate = accumulate(surrogate, entropy_term.sum_all()?.neg()?)?;
                }

                if let Some(score_function) = parts.score_function.as_ref() {
                    let log_r = compute_site_log_r(
                        &model_trace,
                        &guide_trace,
                        name,
                        parts.log_pdf.dims(),
                    )?;
                    surrogate = accumulate(surrogate, (log_r * score_function)?.sum_all()?)?;
                }
            }

            elbo += elbo_particle / num_particles;

            let trainable: BTreeSet<String> = model_trace
                .param_names()
                .into_iter()
                .chain(guide_trace.param_names())
                .collect();

            debug!(
                "particle {}: elbo {:.4}, {} trainable params",
                particle,
                elbo_particle,
                trainable.len()
            );

            if let Some(surrogate) = surrogate.filter(|s| s.track_op() && !trainable.is_empty()) {
                let surrogate_loss = surrogate.affine(-1.0 / num_particles, 0.0)?;
                let grads = surrogate_loss.backward()?;
                params.accumulate_grads(&grads, &trainable)?;
                params.mark_params_active(&trainable)?;
            }
        }

        let loss = -elbo;
        if is_nan(loss) {
            warn!("Encountered NaN loss");
        }
        Ok(loss)
    }
}

fn accumulate(total: Option<Tensor>, term: Tensor) -> Result<Option<Tensor>> {
    Ok(Some(match total {
        Some(total) => (total + term)?,
        None => term,
    }))
}
