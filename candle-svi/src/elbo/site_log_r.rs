use candle_core::Tensor;

use crate::error::{Result, SviError};
use crate::multi_view::{sum_leftmost_all_but, MultiViewTensor};
use crate::trace::{n_compatible_indices, Site, Trace};

/// Log importance ratio `log p - log q` as seen from `target_site`.
///
/// Every sample site of the model contributes its model log density, minus
/// the guide log density when it is latent. The term is detached, then
/// every batch dim it does not share with `target_site` is summed out
/// before accumulation. The result has exactly `target_shape`.
///
/// * `model_trace` - model replayed on the guide, log densities computed
/// * `guide_trace` - guide with score parts computed
/// * `target_site` - latent site the ratio weighs
/// * `target_shape` - shape of the target's guide log density
pub fn compute_site_log_r(
    model_trace: &Trace,
    guide_trace: &Trace,
    target_site: &str,
    target_shape: &[usize],
) -> Result<Tensor> {
    let mut log_r = MultiViewTensor::new();

    for model_site in model_trace.iter() {
        let Some(model_sample) = model_site.as_sample() else {
            continue;
        };
        let name = model_sample.name();

        let mut term = model_sample.batch_log_pdf()?.clone();
        if !model_site.is_observed() {
            let guide_sample = guide_trace
                .get(name)
                .and_then(Site::as_sample)
                .ok_or_else(|| SviError::UnknownSite(name.to_string()))?;
            term = term.broadcast_sub(&guide_sample.score_parts()?.log_pdf)?;
        }
        let term = term.detach();

        let keep = n_compatible_indices(model_trace, name, target_site)?;
        log_r.add_tensor(sum_leftmost_all_but(&term, keep)?)?;
    }

    log_r.contract(target_shape)
}
