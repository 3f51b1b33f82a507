pub mod bernoulli;
pub mod normal;

use anyhow::Result;
use candle_nn::{AdamW, ParamsAdamW};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::RngCore;

use crate::elbo::{ElboConfig, TraceElbo};
use crate::param_store::ParamStore;
use crate::svi::Svi;
use crate::trace::Program;

pub use bernoulli::BernoulliArgs;
pub use normal::NormalArgs;

#[derive(Parser)]
#[command(name = "candle-svi")]
#[command(about = "Stochastic variational inference on toy conjugate models")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fit a Gaussian guide to the posterior mean of Normal data
    Normal(NormalArgs),
    /// Fit a Bernoulli guide to a discrete switch with a Normal child
    Bernoulli(BernoulliArgs),
}

/// Optimisation settings shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct FitArgs {
    #[arg(long, default_value = "10", help = "Monte-Carlo particles per gradient estimate")]
    pub num_particles: usize,

    #[arg(long, default_value = "2000")]
    pub num_steps: usize,

    #[arg(long, default_value = "0.01")]
    pub learning_rate: f64,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Run `num_steps` SVI steps with AdamW and return the loss trace.
pub(crate) fn fit<M, G>(
    model: &M,
    guide: &G,
    params: &ParamStore,
    max_plate_nesting: usize,
    args: &FitArgs,
    rng: &mut dyn RngCore,
) -> Result<Vec<f64>>
where
    M: Program + ?Sized,
    G: Program + ?Sized,
{
    let elbo = TraceElbo::new(ElboConfig::new(args.num_particles, max_plate_nesting)?)?;
    let adam = ParamsAdamW {
        lr: args.learning_rate,
        weight_decay: 0.0,
        ..Default::default()
    };
    let mut svi = Svi::<AdamW>::new(elbo, adam);

    let pb = ProgressBar::new(args.num_steps as u64);
    if args.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    info!("Training for {} steps", args.num_steps);
    let mut loss_trace = Vec::with_capacity(args.num_steps);
    for step in 0..args.num_steps {
        let loss = svi.step(model, guide, params, &mut *rng)?;
        loss_trace.push(loss);
        pb.inc(1);

        if args.verbose && (step % 100 == 0 || step + 1 == args.num_steps) {
            info!("[{:5}] loss = {:10.4}", step + 1, loss);
        }
    }
    pb.finish_and_clear();

    let final_loss = svi.evaluate_loss(model, guide, params, &mut *rng)?;
    info!("final loss estimate: {:.4}", final_loss);
    Ok(loss_trace)
}
