use super::Trace;
use crate::error::{Result, SviError};

/// Number of leading plate frames two sample sites share.
///
/// Plates are allocated from the right (outermost plate at dim -1), so the
/// shared outer frames are exactly the rightmost batch dims that the two
/// sites' log densities have in common. Everything left of them belongs to
/// one site only and has to be summed out before the terms are combined.
pub fn n_compatible_indices(trace: &Trace, site1: &str, site2: &str) -> Result<usize> {
    let stack1 = trace
        .plate_stack(site1)
        .ok_or_else(|| SviError::UnknownSite(site1.to_string()))?;
    let stack2 = trace
        .plate_stack(site2)
        .ok_or_else(|| SviError::UnknownSite(site2.to_string()))?;

    Ok(stack1
        .iter()
        .zip(stack2.iter())
        .take_while(|(frame1, frame2)| frame1 == frame2)
        .count())
}
