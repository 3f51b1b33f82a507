use log::debug;

use super::{SampleSite, Site, Trace};
use crate::error::{Result, SviError};

/// Drop the plate bookkeeping sites.
pub fn prune_subsample_sites(mut trace: Trace) -> Trace {
    trace.retain(|site| !site.is_subsample());
    trace
}

/// Check that every latent site of the guide is a latent site of the model
/// with the same value shape, and vice versa.
pub fn check_model_guide_match(model_trace: &Trace, guide_trace: &Trace) -> Result<()> {
    let mismatch = |site: &str, reason: String| SviError::ModelGuideMismatch {
        site: site.to_string(),
        reason,
    };

    for guide_site in guide_trace.iter() {
        let Site::Sample(guide_sample) = guide_site else {
            continue;
        };
        let name = guide_sample.name();
        match model_trace.get(name) {
            Some(Site::Sample(model_sample)) => {
                let (model_dims, guide_dims) = (model_sample.value().dims(), guide_sample.value().dims());
                if model_dims != guide_dims {
                    return Err(mismatch(
                        name,
                        format!("model shape {:?} vs guide shape {:?}", model_dims, guide_dims),
                    ));
                }
            }
            Some(Site::Observe(_)) => {
                return Err(mismatch(name, "observed in the model but sampled in the guide".into()));
            }
            Some(_) => {
                return Err(mismatch(name, "not a sample site in the model".into()));
            }
            None => {
                return Err(mismatch(name, "found in the guide but not in the model".into()));
            }
        }
    }

    for model_site in model_trace.iter() {
        if let Site::Sample(model_sample) = model_site {
            if !matches!(guide_trace.get(model_sample.name()), Some(Site::Sample(_))) {
                return Err(mismatch(
                    model_sample.name(),
                    "found in the model but not in the guide".into(),
                ));
            }
        }
    }

    debug!(
        "model/guide match: {} model sites, {} guide sites",
        model_trace.len(),
        guide_trace.len()
    );
    Ok(())
}

/// Check the batch shape of a site's log density against its plates.
///
/// Each plate frame pins the size of its dim; dims without a plate must be
/// singleton, except those left of `max_plate_nesting`, which are ignored.
pub fn check_site_shape(site: &SampleSite, max_plate_nesting: usize) -> Result<()> {
    let actual = site.batch_log_pdf()?.dims();

    let mut expected: Vec<Option<usize>> = vec![];
    for frame in site.plate_stack() {
        let from_right = frame.dim.unsigned_abs();
        if expected.len() < from_right {
            let mut padded = vec![None; from_right - expected.len()];
            padded.append(&mut expected);
            expected = padded;
        }
        let at = expected.len() - from_right;
        if expected[at].is_some() {
            return Err(SviError::PlateDimCollision {
                site: site.name().to_string(),
                plate: frame.name.to_string(),
                dim: frame.dim,
            });
        }
        expected[at] = Some(frame.size);
    }

    if expected.len() > max_plate_nesting {
        return Err(SviError::PlateOverflow {
            site: site.name().to_string(),
            required: expected.len(),
        });
    }

    let actual = if max_plate_nesting < actual.len() {
        &actual[actual.len() - max_plate_nesting..]
    } else {
        actual
    };

    let rank = actual.len().max(expected.len());
    for k in 0..rank {
        let actual_size = if k < actual.len() {
            actual[actual.len() - 1 - k]
        } else {
            1
        };
        let expected_size = if k < expected.len() {
            expected[expected.len() - 1 - k]
        } else {
            Some(1)
        };
        if let Some(expected_size) = expected_size {
            if expected_size != actual_size {
                return Err(SviError::InvalidSiteShape {
                    site: site.name().to_string(),
                    expected,
                    actual: actual.to_vec(),
                });
            }
        }
    }
    Ok(())
}

pub fn is_nan(x: f64) -> bool {
    x.is_nan()
}
