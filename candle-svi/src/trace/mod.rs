//! Execution traces of probabilistic programs.
//!
//! A [`Trace`] is an ordered map from site name to [`Site`], filled in by a
//! [`TraceContext`] while a [`Program`] runs. Once recorded, a trace is only
//! read, except for the log densities the estimator fills in through
//! [`Trace::compute_batch_log_pdf`] and [`Trace::compute_score_parts`].

mod alignment;
mod checks;
mod context;

pub use alignment::n_compatible_indices;
pub use checks::{check_model_guide_match, check_site_shape, is_nan, prune_subsample_sites};
pub use context::{replay_program, trace_program, Program, TraceContext};

use std::collections::{BTreeSet, HashMap};

use candle_core::{DType, Tensor};

use crate::distributions::{scale_log_pdf, Distribution, ScoreParts};
use crate::error::{Result, SviError};

/// One enclosing plate of a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateFrame {
    pub name: Box<str>,
    /// broadcast dim counted from the right, always negative
    pub dim: isize,
    /// number of elements actually visited
    pub size: usize,
    /// number of elements in the full plate
    pub full_size: usize,
}

impl PlateFrame {
    /// log-density multiplier compensating for subsampling
    pub fn scale(&self) -> f64 {
        self.full_size as f64 / self.size as f64
    }
}

/// A sampled or observed random variable.
#[derive(Debug)]
pub struct SampleSite {
    pub(crate) name: Box<str>,
    pub(crate) dist: Box<dyn Distribution>,
    pub(crate) value: Tensor,
    pub(crate) scale: f64,
    pub(crate) plate_stack: Vec<PlateFrame>,
    pub(crate) batch_log_pdf: Option<Tensor>,
    pub(crate) log_pdf: Option<Tensor>,
    pub(crate) score_parts: Option<ScoreParts>,
}

impl SampleSite {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn dist(&self) -> &dyn Distribution {
        self.dist.as_ref()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Enclosing plates, outermost first.
    pub fn plate_stack(&self) -> &[PlateFrame] {
        &self.plate_stack
    }

    /// Scaled log density with batch dims unreduced.
    pub fn batch_log_pdf(&self) -> Result<&Tensor> {
        self.batch_log_pdf
            .as_ref()
            .ok_or_else(|| SviError::MissingLogPdf(self.name.to_string()))
    }

    /// Scalar sum of [`Self::batch_log_pdf`].
    pub fn log_pdf(&self) -> Result<&Tensor> {
        self.log_pdf
            .as_ref()
            .ok_or_else(|| SviError::MissingLogPdf(self.name.to_string()))
    }

    pub fn score_parts(&self) -> Result<&ScoreParts> {
        self.score_parts
            .as_ref()
            .ok_or_else(|| SviError::MissingLogPdf(self.name.to_string()))
    }

    fn fill_batch_log_pdf(&mut self) -> Result<()> {
        if self.batch_log_pdf.is_none() {
            let batch_log_pdf = scale_log_pdf(self.dist.log_prob(&self.value)?, self.scale)?;
            self.log_pdf = Some(batch_log_pdf.sum_all()?);
            self.batch_log_pdf = Some(batch_log_pdf);
        }
        Ok(())
    }

    fn fill_score_parts(&mut self) -> Result<()> {
        if self.score_parts.is_none() {
            let parts = self.dist.score_parts(&self.value, self.scale)?;
            self.log_pdf = Some(parts.log_pdf.sum_all()?);
            self.batch_log_pdf = Some(parts.log_pdf.clone());
            self.score_parts = Some(parts);
        }
        Ok(())
    }
}

/// A trainable parameter read by the program.
#[derive(Debug, Clone)]
pub struct ParamSite {
    pub name: Box<str>,
    pub value: Tensor,
}

/// Bookkeeping record of the indices a plate visited.
#[derive(Debug, Clone)]
pub struct SubsampleSite {
    pub name: Box<str>,
    pub size: usize,
    pub indices: Vec<u32>,
}

#[derive(Debug)]
pub enum Site {
    Sample(SampleSite),
    Observe(SampleSite),
    Param(ParamSite),
    Subsample(SubsampleSite),
}

impl Site {
    pub fn name(&self) -> &str {
        match self {
            Site::Sample(site) | Site::Observe(site) => &site.name,
            Site::Param(site) => &site.name,
            Site::Subsample(site) => &site.name,
        }
    }

    /// Sample and observe sites both carry a [`SampleSite`].
    pub fn as_sample(&self) -> Option<&SampleSite> {
        match self {
            Site::Sample(site) | Site::Observe(site) => Some(site),
            _ => None,
        }
    }

    fn as_sample_mut(&mut self) -> Option<&mut SampleSite> {
        match self {
            Site::Sample(site) | Site::Observe(site) => Some(site),
            _ => None,
        }
    }

    pub fn is_observed(&self) -> bool {
        matches!(self, Site::Observe(_))
    }

    pub fn is_subsample(&self) -> bool {
        matches!(self, Site::Subsample(_))
    }
}

#[derive(Debug, Default)]
pub struct Trace {
    sites: Vec<Site>,
    index: HashMap<Box<str>, usize>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a site. Names are unique, except that a parameter may be read
    /// more than once; later reads of the same parameter are not recorded
    /// again.
    pub fn add(&mut self, site: Site) -> Result<()> {
        if let Some(&at) = self.index.get(site.name()) {
            return match (&self.sites[at], &site) {
                (Site::Param(_), Site::Param(_)) => Ok(()),
                _ => Err(SviError::DuplicateSite(site.name().to_string())),
            };
        }
        self.index.insert(site.name().into(), self.sites.len());
        self.sites.push(site);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Site> {
        self.index.get(name).map(|&at| &self.sites[at])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Sites in recording order.
    pub fn iter(&self) -> impl Iterator<Item = &Site> {
        self.sites.iter()
    }

    /// Sample and observe sites in recording order.
    pub fn sample_sites(&self) -> impl Iterator<Item = &SampleSite> {
        self.sites.iter().filter_map(Site::as_sample)
    }

    /// Plate frames enclosing a sample site, outermost first.
    pub fn plate_stack(&self, name: &str) -> Option<&[PlateFrame]> {
        self.get(name)
            .and_then(Site::as_sample)
            .map(SampleSite::plate_stack)
    }

    /// Names of every parameter read during the execution.
    pub fn param_names(&self) -> BTreeSet<String> {
        self.sites
            .iter()
            .filter_map(|site| match site {
                Site::Param(param) => Some(param.name.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Site) -> bool,
    {
        self.sites.retain(|site| keep(site));
        self.index = self
            .sites
            .iter()
            .enumerate()
            .map(|(at, site)| (site.name().into(), at))
            .collect();
    }

    /// Fill `batch_log_pdf` and `log_pdf` of every sample site.
    pub fn compute_batch_log_pdf(&mut self) -> Result<()> {
        for site in self.sites.iter_mut().filter_map(Site::as_sample_mut) {
            site.fill_batch_log_pdf()?;
        }
        Ok(())
    }

    /// Fill `score_parts` of every latent site, and the log densities of
    /// every sample site.
    pub fn compute_score_parts(&mut self) -> Result<()> {
        for site in self.sites.iter_mut() {
            match site {
                Site::Sample(sample) => sample.fill_score_parts()?,
                Site::Observe(sample) => sample.fill_batch_log_pdf()?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Total log density over all sample sites, as a plain number.
    pub fn log_pdf(&self) -> Result<f64> {
        let mut total = 0.0;
        for site in self.sample_sites() {
            total += scalar_value(site.log_pdf()?)?;
        }
        Ok(total)
    }
}

pub(crate) fn scalar_value(x: &Tensor) -> Result<f64> {
    Ok(x.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
