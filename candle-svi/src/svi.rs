//! Stochastic variational inference loop.

use std::collections::BTreeSet;

use candle_nn::Optimizer;
use log::debug;
use rand::RngCore;

use crate::elbo::TraceElbo;
use crate::error::Result;
use crate::param_store::ParamStore;
use crate::trace::Program;

/// Pairs a [`TraceElbo`] with a `candle_nn` optimizer.
///
/// Parameters are created on first use inside the programs, so the
/// optimizer is built lazily from the parameter store after the first
/// gradient estimate, and rebuilt (dropping its state) whenever new
/// parameters show up.
pub struct Svi<O: Optimizer> {
    elbo: TraceElbo,
    optimizer_config: O::Config,
    optimizer: Option<(BTreeSet<String>, O)>,
}

impl<O> Svi<O>
where
    O: Optimizer,
    O::Config: Clone,
{
    pub fn new(elbo: TraceElbo, optimizer_config: O::Config) -> Self {
        Self {
            elbo,
            optimizer_config,
            optimizer: None,
        }
    }

    pub fn elbo(&self) -> &TraceElbo {
        &self.elbo
    }

    /// Take one gradient step and return the loss estimate.
    pub fn step<M, G>(
        &mut self,
        model: &M,
        guide: &G,
        params: &ParamStore,
        rng: &mut dyn RngCore,
    ) -> Result<f64>
    where
        M: Program + ?Sized,
        G: Program + ?Sized,
    {
        let loss = self.elbo.loss_and_grads(model, guide, params, rng)?;

        if let Some(grads) = params.active_grad_store()? {
            let optimizer = self.optimizer(params)?;
            optimizer.step(&grads)?;
        }
        params.reset()?;
        Ok(loss)
    }

    /// Loss estimate without touching the parameters.
    pub fn evaluate_loss<M, G>(
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
        self.elbo.loss(model, guide, params, rng)
    }

    fn optimizer(&mut self, params: &ParamStore) -> Result<&mut O> {
        let names: BTreeSet<String> = params.names()?.into_iter().collect();
        let optimizer = match self.optimizer.take() {
            Some((known, optimizer)) if known == names => optimizer,
            _ => {
                debug!("building optimizer over {} parameters", names.len());
                O::new(params.all_vars()?, self.optimizer_config.clone())?
            }
        };
        Ok(&mut self.optimizer.insert((names, optimizer)).1)
    }
}
