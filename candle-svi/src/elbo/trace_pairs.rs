use log::trace;
use rand::RngCore;

use super::ElboConfig;
use crate::error::Result;
use crate::param_store::ParamStore;
use crate::trace::{
    check_model_guide_match, check_site_shape, prune_subsample_sites, replay_program,
    trace_program, Program, Trace,
};

/// Lazy sequence of `(model_trace, guide_trace)` pairs, one per particle.
///
/// Each pair is produced only when requested: the guide runs first, then
/// the model replays the guide's choices. The sequence stops after the
/// first error.
pub struct TracePairs<'a, M: ?Sized, G: ?Sized> {
    model: &'a M,
    guide: &'a G,
    params: &'a ParamStore,
    rng: &'a mut dyn RngCore,
    max_plate_nesting: usize,
    remaining: usize,
}

impl<'a, M, G> TracePairs<'a, M, G>
where
    M: Program + ?Sized,
    G: Program + ?Sized,
{
    pub(crate) fn new(
        model: &'a M,
        guide: &'a G,
        params: &'a ParamStore,
        rng: &'a mut dyn RngCore,
        config: &ElboConfig,
    ) -> Self {
        Self {
            model,
            guide,
            params,
            rng,
            max_plate_nesting: config.max_plate_nesting,
            remaining: config.num_particles,
        }
    }

    fn next_pair(&mut self) -> Result<(Trace, Trace)> {
        let guide_trace = trace_program(self.guide, self.params, &mut *self.rng)?;
        let model_trace = replay_program(self.model, self.params, &mut *self.rng, &guide_trace)?;

        check_model_guide_match(&model_trace, &guide_trace)?;
        let mut guide_trace = prune_subsample_sites(guide_trace);
        let mut model_trace = prune_subsample_sites(model_trace);

        model_trace.compute_batch_log_pdf()?;
        guide_trace.compute_score_parts()?;

        for site in model_trace.sample_sites().chain(guide_trace.sample_sites()) {
            check_site_shape(site, self.max_plate_nesting)?;
        }

        trace!(
            "trace pair: {} model sites, {} guide sites",
            model_trace.len(),
            guide_trace.len()
        );
        Ok((model_trace, guide_trace))
    }
}

impl<M, G> Iterator for TracePairs<'_, M, G>
where
    M: Program + ?Sized,
    G: Program + ?Sized,
{
    type Item = Result<(Trace, Trace)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.next_pair() {
            Ok(pair) => {
                self.remaining -= 1;
                Some(Ok(pair))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
