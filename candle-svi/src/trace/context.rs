use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::Init;
use log::trace;
use rand::RngCore;

use super::{ParamSite, PlateFrame, SampleSite, Site, SubsampleSite, Trace};
use crate::distributions::Distribution;
use crate::error::{Result, SviError};
use crate::param_store::ParamStore;

/// A probabilistic program: anything that can run against a trace context.
///
/// Plain functions and closures with the matching signature are programs;
/// data-carrying programs implement the trait on a struct.
pub trait Program {
    fn run(&self, ctx: &mut TraceContext<'_>) -> Result<()>;
}

impl<F> Program for F
where
    F: Fn(&mut TraceContext<'_>) -> Result<()>,
{
    fn run(&self, ctx: &mut TraceContext<'_>) -> Result<()> {
        self(ctx)
    }
}

/// Records the sites of one program execution.
///
/// With a replay trace attached, latent sites and plate subsamples whose
/// names appear in the replay trace reuse its values instead of drawing new
/// ones.
pub struct TraceContext<'a> {
    params: &'a ParamStore,
    rng: &'a mut dyn RngCore,
    replay: Option<&'a Trace>,
    plates: Vec<PlateFrame>,
    trace: Trace,
}

impl<'a> TraceContext<'a> {
    pub fn new(params: &'a ParamStore, rng: &'a mut dyn RngCore) -> Self {
        Self {
            params,
            rng,
            replay: None,
            plates: vec![],
            trace: Trace::new(),
        }
    }

    /// Reuse sampled values of `reference` at matching names.
    pub fn replaying(mut self, reference: &'a Trace) -> Self {
        self.replay = Some(reference);
        self
    }

    pub fn device(&self) -> &Device {
        self.params.device()
    }

    pub fn dtype(&self) -> DType {
        self.params.dtype()
    }

    /// Scalar constant in the context's dtype and device.
    pub fn constant(&self, value: f64) -> Result<Tensor> {
        Ok(Tensor::new(value, self.device())?.to_dtype(self.dtype())?)
    }

    /// Read (creating it on first use) a trainable parameter.
    pub fn param<S: Into<Shape>>(&mut self, name: &str, shape: S, init: Init) -> Result<Tensor> {
        let value = self.params.param(name, shape, init)?;
        self.record_param(name, value)
    }

    /// Read (creating it from `init` on first use) a trainable parameter.
    pub fn param_from_tensor(&mut self, name: &str, init: &Tensor) -> Result<Tensor> {
        let value = self.params.param_from_tensor(name, init)?;
        self.record_param(name, value)
    }

    fn record_param(&mut self, name: &str, value: Tensor) -> Result<Tensor> {
        self.trace.add(Site::Param(ParamSite {
            name: name.into(),
            value: value.clone(),
        }))?;
        Ok(value)
    }

    /// Draw a latent value, or take it from the replay trace.
    pub fn sample<D: Distribution + 'static>(&mut self, name: &str, dist: D) -> Result<Tensor> {
        let replayed = match self.replay.and_then(|reference| reference.get(name)) {
            Some(Site::Sample(site)) => Some(site.value.clone()),
            _ => None,
        };
        let value = match replayed {
            Some(value) => value,
            None => dist.sample(&mut *self.rng)?,
        };
        trace!("sample site {}: {:?}", name, value.dims());
        let site = self.sample_site(name, Box::new(dist), value.clone());
        self.trace.add(Site::Sample(site))?;
        Ok(value)
    }

    /// Condition on observed data.
    pub fn observe<D: Distribution + 'static>(
        &mut self,
        name: &str,
        dist: D,
        value: &Tensor,
    ) -> Result<Tensor> {
        let site = self.sample_site(name, Box::new(dist), value.clone());
        self.trace.add(Site::Observe(site))?;
        Ok(value.clone())
    }

    fn sample_site(&self, name: &str, dist: Box<dyn Distribution>, value: Tensor) -> SampleSite {
        SampleSite {
            name: name.into(),
            dist,
            value,
            scale: self.plates.iter().map(PlateFrame::scale).product(),
            plate_stack: self.plates.clone(),
            batch_log_pdf: None,
            log_pdf: None,
            score_parts: None,
        }
    }

    /// Run `body` inside a plate of conditionally independent elements.
    ///
    /// The plate takes the next free broadcast dim: the outermost plate owns
    /// dim -1 and each nested plate sits one dim further left. With
    /// `subsample_size` smaller than `size`, a random subset of indices is
    /// visited and every enclosed site is scaled by `size / subsample_size`.
    ///
    /// * `name` - plate name, recorded as a subsample site
    /// * `size` - number of elements in the full plate
    /// * `subsample_size` - number of elements to visit, all if `None`
    /// * `body` - receives the context and the visited indices (u32)
    pub fn plate<T, F>(
        &mut self,
        name: &str,
        size: usize,
        subsample_size: Option<usize>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Self, &Tensor) -> Result<T>,
    {
        let subsample_size = subsample_size.unwrap_or(size).min(size);
        if subsample_size == 0 {
            return Err(SviError::InvalidConfig(format!(
                "plate \"{}\" must visit at least one element",
                name
            )));
        }

        let replayed = match self.replay.and_then(|reference| reference.get(name)) {
            Some(Site::Subsample(site)) => Some(site.indices.clone()),
            _ => None,
        };
        let indices: Vec<u32> = match replayed {
            Some(indices) => indices,
            None if subsample_size == size => (0..size as u32).collect(),
            None => rand::seq::index::sample(&mut *self.rng, size, subsample_size)
                .iter()
                .map(|i| i as u32)
                .collect(),
        };

        let index_tensor = Tensor::from_vec(indices.clone(), indices.len(), self.device())?;
        let frame = PlateFrame {
            name: name.into(),
            dim: -(self.plates.len() as isize) - 1,
            size: indices.len(),
            full_size: size,
        };

        self.trace.add(Site::Subsample(SubsampleSite {
            name: name.into(),
            size,
            indices,
        }))?;

        self.plates.push(frame);
        let out = body(self, &index_tensor);
        self.plates.pop();
        out
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }
}

/// Run `program` once and record its trace.
pub fn trace_program<P: Program + ?Sized>(
    program: &P,
    params: &ParamStore,
    rng: &mut dyn RngCore,
) -> Result<Trace> {
    let mut ctx = TraceContext::new(params, rng);
    program.run(&mut ctx)?;
    Ok(ctx.into_trace())
}

/// Run `program` with the sampled values of `reference` substituted at
/// matching site names, and record its trace.
pub fn replay_program<P: Program + ?Sized>(
    program: &P,
    params: &ParamStore,
    rng: &mut dyn RngCore,
    reference: &Trace,
) -> Result<Trace> {
    let mut ctx = TraceContext::new(params, rng).replaying(reference);
    program.run(&mut ctx)?;
    Ok(ctx.into_trace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::Normal;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn nested(ctx: &mut TraceContext<'_>) -> Result<()> {
        let loc = ctx.constant(0.0)?;
        let scale = ctx.constant(1.0)?;
        ctx.sample("global", Normal::new(loc.clone(), scale.clone())?)?;
        ctx.plate("outer", 10, Some(5), |ctx, outer| {
            assert_eq!(outer.dims(), &[5]);
            ctx.sample("a", Normal::new(loc.clone(), scale.ones_like()?.broadcast_as(5)?)?)?;
            ctx.plate("inner", 3, None, |ctx, _| {
                let inner_scale = scale.ones_like()?.broadcast_as((3, 5))?;
                ctx.sample("b", Normal::new(loc.clone(), inner_scale)?)?;
                Ok(())
            })
        })
    }

    #[test]
    fn test_plate_frames_and_scale() -> Result<()> {
        let params = ParamStore::new(DType::F64, Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);
        let trace = trace_program(&nested, &params, &mut rng)?;

        assert_eq!(trace.plate_stack("global"), Some(&[][..]));

        let a = trace.get("a").and_then(Site::as_sample).expect("a");
        assert_eq!(a.plate_stack().len(), 1);
        assert_eq!(a.plate_stack()[0].dim, -1);
        assert_eq!(a.scale(), 2.0);

        let b = trace.get("b").and_then(Site::as_sample).expect("b");
        let dims: Vec<isize> = b.plate_stack().iter().map(|f| f.dim).collect();
        assert_eq!(dims, vec![-1, -2]);
        assert_eq!(b.value().dims(), &[3, 5]);

        assert!(trace.get("outer").map(Site::is_subsample).unwrap_or(false));
        Ok(())
    }

    #[test]
    fn test_replay_reuses_values_and_indices() -> Result<()> {
        let params = ParamStore::new(DType::F64, Device::Cpu);
        let mut rng = StdRng::seed_from_u64(1);
        let first = trace_program(&nested, &params, &mut rng)?;
        let second = replay_program(&nested, &params, &mut rng, &first)?;

        for name in ["global", "a", "b"] {
            let x = first.get(name).and_then(Site::as_sample).expect(name);
            let y = second.get(name).and_then(Site::as_sample).expect(name);
            let diff: f64 = (x.value() - y.value())?.abs()?.sum_all()?.to_scalar()?;
            assert_eq!(diff, 0.0);
        }

        match (first.get("outer"), second.get("outer")) {
            (Some(Site::Subsample(x)), Some(Site::Subsample(y))) => assert_eq!(x.indices, y.indices),
            _ => panic!("missing subsample sites"),
        }
        Ok(())
    }

    #[test]
    fn test_params_recorded() -> Result<()> {
        let params = ParamStore::new(DType::F64, Device::Cpu);
        let mut rng = StdRng::seed_from_u64(2);
        let program = |ctx: &mut TraceContext<'_>| -> Result<()> {
            let mu = ctx.param("mu", (), Init::Const(0.5))?;
            let _again = ctx.param("mu", (), Init::Const(0.0))?;
            let init = Tensor::new(&[1.0f64, 2.0], ctx.device())?;
            let shift = ctx.param_from_tensor("shift", &init)?;
            let sigma = ctx.constant(1.0)?;
            ctx.sample("x", Normal::new(mu.broadcast_add(&shift)?, sigma)?)?;
            Ok(())
        };
        let trace = trace_program(&program, &params, &mut rng)?;

        let names: Vec<String> = trace.param_names().into_iter().collect();
        assert_eq!(names, vec!["mu".to_string(), "shift".to_string()]);
        let mu: f64 = params.get("mu")?.expect("mu").to_scalar()?;
        assert_eq!(mu, 0.5);
        let shift = params.get("shift")?.expect("shift").to_vec1::<f64>()?;
        assert_eq!(shift, vec![1.0, 2.0]);
        Ok(())
    }
}
