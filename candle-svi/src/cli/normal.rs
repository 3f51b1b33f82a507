use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::Init;
use clap::Args;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::{fit, FitArgs};
use crate::distributions::Normal;
use crate::param_store::ParamStore;
use crate::trace::{Program, TraceContext};

#[derive(Args, Debug)]
pub struct NormalArgs {
    #[command(flatten)]
    pub fit: FitArgs,

    #[arg(long, default_value = "100", help = "Number of simulated observations")]
    pub num_data: usize,

    #[arg(long, default_value = "1.5", help = "Mean used to simulate the data")]
    pub true_mean: f64,

    #[arg(long, help = "Visit a random subset of the data per step")]
    pub subsample_size: Option<usize>,
}

/// mu ~ N(0, 1), y_i | mu ~ N(mu, 1)
pub struct NormalModel {
    pub data: Tensor,
    pub subsample_size: Option<usize>,
}

impl Program for NormalModel {
    fn run(&self, ctx: &mut TraceContext<'_>) -> crate::error::Result<()> {
        let zero = ctx.constant(0.0)?;
        let one = ctx.constant(1.0)?;
        let mu = ctx.sample("mu", Normal::new(zero, one.clone())?)?;

        let n = self.data.dim(0)?;
        ctx.plate("data", n, self.subsample_size, |ctx, indices| {
            let y = self.data.index_select(indices, 0)?;
            let likelihood = Normal::new(mu.broadcast_as(y.shape())?, one)?;
            ctx.observe("y", likelihood, &y)?;
            Ok(())
        })
    }
}

/// mu ~ N(mu_q, exp(log_sigma_q)²)
pub fn normal_guide(ctx: &mut TraceContext<'_>) -> crate::error::Result<()> {
    let loc = ctx.param("mu_q", (), Init::Const(0.0))?;
    let log_scale = ctx.param("log_sigma_q", (), Init::Const(0.0))?;
    ctx.sample("mu", Normal::new(loc, log_scale.exp()?)?)?;
    Ok(())
}

/// Exact posterior of mu: N(Σy / (n + 1), 1 / (n + 1))
pub fn posterior(data: &[f64]) -> (f64, f64) {
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / (n + 1.0);
    (mean, (1.0 / (n + 1.0)).sqrt())
}

pub fn run(args: &NormalArgs) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(args.fit.seed);
    let device = Device::Cpu;

    let data: Vec<f64> = (0..args.num_data)
        .map(|_| args.true_mean + rng.sample::<f64, _>(StandardNormal))
        .collect();
    info!("Simulated {} observations around {}", data.len(), args.true_mean);

    let model = NormalModel {
        data: Tensor::from_vec(data.clone(), data.len(), &device)?,
        subsample_size: args.subsample_size,
    };
    let params = ParamStore::new(DType::F64, device);

    let losses = fit(&model, &normal_guide, &params, 1, &args.fit, &mut rng)?;
    if let (Some(first), Some(last)) = (losses.first(), losses.last()) {
        info!("loss: {:.4} -> {:.4}", first, last);
    }

    let mu_q: f64 = params
        .get("mu_q")?
        .ok_or_else(|| anyhow::anyhow!("mu_q"))?
        .to_scalar()?;
    let sigma_q: f64 = params
        .get("log_sigma_q")?
        .ok_or_else(|| anyhow::anyhow!("log_sigma_q"))?
        .to_scalar::<f64>()?
        .exp();

    let (mean, sd) = posterior(&data);
    info!("guide:     mean = {:.4}, sd = {:.4}", mu_q, sigma_q);
    info!("posterior: mean = {:.4}, sd = {:.4}", mean, sd);
    Ok(())
}
