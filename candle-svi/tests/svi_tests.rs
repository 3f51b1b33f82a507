use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, ParamsAdamW, SGD};
use candle_svi::cli::bernoulli::{posterior as switch_posterior, switch_guide, SwitchModel};
use candle_svi::cli::normal::{normal_guide, posterior, NormalModel};
use candle_svi::{ElboConfig, ParamStore, Svi, TraceElbo};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn adam(lr: f64) -> ParamsAdamW {
    ParamsAdamW {
        lr,
        weight_decay: 0.0,
        ..Default::default()
    }
}

fn scalar_param(params: &ParamStore, name: &str) -> anyhow::Result<f64> {
    let value = params
        .get(name)?
        .ok_or_else(|| anyhow::anyhow!("missing parameter {}", name))?;
    Ok(value.to_scalar::<f64>()?)
}

#[test]
fn normal_guide_recovers_posterior() -> anyhow::Result<()> {
    let data = vec![1.2, 0.8, 1.9, 1.4, 0.6, 1.1, 2.0, 1.3, 0.9, 1.5];
    let model = NormalModel {
        data: Tensor::from_vec(data.clone(), data.len(), &Device::Cpu)?,
        subsample_size: None,
    };
    let params = ParamStore::new(DType::F64, Device::Cpu);
    let mut rng = StdRng::seed_from_u64(42);

    let elbo = TraceElbo::new(ElboConfig::new(8, 1)?)?;
    let mut svi = Svi::<AdamW>::new(elbo, adam(0.02));

    for _ in 0..2000 {
        let loss = svi.step(&model, &normal_guide, &params, &mut rng)?;
        assert!(loss.is_finite());
    }

    let (mean, sd) = posterior(&data);
    let mu_q = scalar_param(&params, "mu_q")?;
    let sigma_q = scalar_param(&params, "log_sigma_q")?.exp();
    assert_abs_diff_eq!(mu_q, mean, epsilon = 0.15);
    assert_abs_diff_eq!(sigma_q, sd, epsilon = 0.1);

    // gradients and active flags are cleared after every step
    assert!(params.active_params()?.is_empty());
    Ok(())
}

#[test]
fn subsampled_steps_move_towards_posterior() -> anyhow::Result<()> {
    let data: Vec<f64> = (0..40).map(|i| 2.0 + 0.05 * (i % 5) as f64).collect();
    let model = NormalModel {
        data: Tensor::from_vec(data.clone(), data.len(), &Device::Cpu)?,
        subsample_size: Some(10),
    };
    let params = ParamStore::new(DType::F64, Device::Cpu);
    let mut rng = StdRng::seed_from_u64(7);

    let elbo = TraceElbo::new(ElboConfig::new(4, 1)?)?;
    let mut svi = Svi::<AdamW>::new(elbo, adam(0.02));
    for _ in 0..1500 {
        svi.step(&model, &normal_guide, &params, &mut rng)?;
    }

    let (mean, _) = posterior(&data);
    assert_abs_diff_eq!(scalar_param(&params, "mu_q")?, mean, epsilon = 0.2);
    Ok(())
}

#[test]
fn score_function_guide_recovers_switch_posterior() -> anyhow::Result<()> {
    let data = vec![1.0, 1.2, 0.9];
    let model = SwitchModel {
        data: Tensor::from_vec(data.clone(), data.len(), &Device::Cpu)?,
        prior: 0.5,
        shift: 1.0,
    };
    let params = ParamStore::new(DType::F64, Device::Cpu);
    let mut rng = StdRng::seed_from_u64(3);

    let elbo = TraceElbo::new(ElboConfig::new(20, 1)?)?;
    let mut svi = Svi::<AdamW>::new(elbo, adam(0.03));
    for _ in 0..800 {
        svi.step(&model, &switch_guide, &params, &mut rng)?;
    }

    let q = 1.0 / (1.0 + (-scalar_param(&params, "logit_q")?).exp());
    assert_abs_diff_eq!(q, switch_posterior(&data, 0.5, 1.0), epsilon = 0.1);
    Ok(())
}

#[test]
fn sgd_step_follows_the_gradient() -> anyhow::Result<()> {
    let data = vec![3.0, 3.0, 3.0];
    let model = NormalModel {
        data: Tensor::from_vec(data, 3, &Device::Cpu)?,
        subsample_size: None,
    };
    let params = ParamStore::new(DType::F64, Device::Cpu);
    let mut rng = StdRng::seed_from_u64(0);

    let elbo = TraceElbo::new(ElboConfig::new(16, 1)?)?;
    let mut svi = Svi::<SGD>::new(elbo, 0.01);
    svi.step(&model, &normal_guide, &params, &mut rng)?;

    // dELBO/dmu_q = Σy - (n + 1) mu_q = 9 at mu_q = 0
    assert!(scalar_param(&params, "mu_q")? > 0.0);
    Ok(())
}

#[test]
fn evaluate_loss_leaves_params_untouched() -> anyhow::Result<()> {
    let model = NormalModel {
        data: Tensor::new(&[0.5f64, 1.5], &Device::Cpu)?,
        subsample_size: None,
    };
    let params = ParamStore::new(DType::F64, Device::Cpu);
    let mut rng = StdRng::seed_from_u64(0);

    let elbo = TraceElbo::new(ElboConfig::default())?;
    let svi = Svi::<AdamW>::new(elbo, adam(0.1));
    assert_eq!(svi.elbo().config().num_particles, 1);
    let loss = svi.evaluate_loss(&model, &normal_guide, &params, &mut rng)?;

    assert!(loss.is_finite());
    assert_eq!(scalar_param(&params, "mu_q")?, 0.0);
    assert!(params.grad("mu_q")?.is_none());
    Ok(())
}
