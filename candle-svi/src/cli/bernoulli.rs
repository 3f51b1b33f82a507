use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::Init;
use clap::Args;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use super::{fit, FitArgs};
use crate::distributions::{Bernoulli, Normal};
use crate::param_store::ParamStore;
use crate::trace::{Program, TraceContext};

#[derive(Args, Debug)]
pub struct BernoulliArgs {
    #[command(flatten)]
    pub fit: FitArgs,

    #[arg(long, default_value = "3", help = "Number of simulated observations")]
    pub num_data: usize,

    #[arg(long, default_value = "0.5", help = "Prior probability of the switch being on")]
    pub prior: f64,

    #[arg(long, default_value = "1.0", help = "Shift of the observation mean when the switch is on")]
    pub shift: f64,

    #[arg(long, help = "Simulate the data with the switch off")]
    pub switch_off: bool,
}

/// z ~ Bernoulli(prior), y_i | z ~ N(shift * z, 1)
pub struct SwitchModel {
    pub data: Tensor,
    pub prior: f64,
    pub shift: f64,
}

impl Program for SwitchModel {
    fn run(&self, ctx: &mut TraceContext<'_>) -> crate::error::Result<()> {
        let prior = ctx.constant(self.prior)?;
        let z = ctx.sample("z", Bernoulli::new(prior))?;
        let loc = z.affine(self.shift, 0.0)?;
        let one = ctx.constant(1.0)?;

        let n = self.data.dim(0)?;
        ctx.plate("data", n, None, |ctx, indices| {
            let y = self.data.index_select(indices, 0)?;
            let likelihood = Normal::new(loc.broadcast_as(y.shape())?, one)?;
            ctx.observe("y", likelihood, &y)?;
            Ok(())
        })
    }
}

/// z ~ Bernoulli(sigmoid(logit_q))
pub fn switch_guide(ctx: &mut TraceContext<'_>) -> crate::error::Result<()> {
    let logit = ctx.param("logit_q", (), Init::Const(0.0))?;
    ctx.sample("z", Bernoulli::from_logits(&logit)?)?;
    Ok(())
}

/// Exact P(z = 1 | y)
pub fn posterior(data: &[f64], prior: f64, shift: f64) -> f64 {
    let log_odds = (prior / (1.0 - prior)).ln()
        + data
            .iter()
            .map(|y| shift * y - 0.5 * shift * shift)
            .sum::<f64>();
    1.0 / (1.0 + (-log_odds).exp())
}

pub fn run(args: &BernoulliArgs) -> Result<()> {
    if args.prior <= 0.0 || args.prior >= 1.0 {
        anyhow::bail!("prior must lie strictly between 0 and 1");
    }

    let mut rng = StdRng::seed_from_u64(args.fit.seed);
    let device = Device::Cpu;

    let mean = if args.switch_off { 0.0 } else { args.shift };
    let data: Vec<f64> = (0..args.num_data)
        .map(|_| mean + rng.sample::<f64, _>(StandardNormal))
        .collect();
    info!("Simulated {} observations around {}", data.len(), mean);

    let model = SwitchModel {
        data: Tensor::from_vec(data.clone(), data.len(), &device)?,
        prior: args.prior,
        shift: args.shift,
    };
    let params = ParamStore::new(DType::F64, device);

    let losses = fit(&model, &switch_guide, &params, 1, &args.fit, &mut rng)?;
    if let (Some(first), Some(last)) = (losses.first(), losses.last()) {
        info!("loss: {:.4} -> {:.4}", first, last);
    }

    let logit_q: f64 = params
        .get("logit_q")?
        .ok_or_else(|| anyhow::anyhow!("logit_q"))?
        .to_scalar()?;
    let q = 1.0 / (1.0 + (-logit_q).exp());

    info!("guide:     P(z = 1) = {:.4}", q);
    info!("posterior: P(z = 1) = {:.4}", posterior(&data, args.prior, args.shift));
    Ok(())
}
