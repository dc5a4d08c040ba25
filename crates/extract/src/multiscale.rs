use layers::{interpolate_bilinear, l2_normalize_in_place};
use ndarray::{Array1, Array4};
use network::RetrievalNet;
use tracing::warn;

use crate::ExtractError;

/// Descriptor of a single `1 x 3 x H x W` input at its own resolution.
pub fn extract_ss(net: &RetrievalNet, input: &Array4<f32>) -> Result<Array1<f32>, ExtractError> {
    let rows = net.forward_rows(input)?;
    Ok(rows.row(0).to_owned())
}

/// Multi-scale descriptor: the input is resized by each factor in `ms`
/// (bilinear, no corner alignment), every descriptor is raised to `msp`,
/// averaged, taken back to the `1 / msp` power and re-normalized.
///
/// With `msp != 1` the power mean is only defined for non-negative
/// descriptors. Whitened networks produce negative components, which come
/// out as NaN; a warning names how many.
pub fn extract_ms(
    net: &RetrievalNet,
    input: &Array4<f32>,
    ms: &[f32],
    msp: f32,
) -> Result<Array1<f32>, ExtractError> {
    if ms.is_empty() {
        return Err(ExtractError::InvalidConfig("no scales given".into()));
    }
    let mut v = Array1::<f32>::zeros(net.outputdim());
    for &s in ms {
        let rows = if s == 1.0 {
            net.forward_rows(input)?
        } else {
            net.forward_rows(&interpolate_bilinear(input, s)?)?
        };
        v.zip_mut_with(&rows.row(0), |acc, &x| *acc += x.powf(msp));
    }
    v /= ms.len() as f32;
    let undefined = undefined_components(&v, msp);
    if undefined > 0 {
        warn!(
            msp,
            undefined,
            "negative descriptor components have no 1/msp power and become NaN; use msp = 1 with whitened networks"
        );
    }
    let inv = msp.recip();
    v.mapv_inplace(|x| x.powf(inv));
    l2_normalize_in_place(v.view_mut());
    Ok(v)
}

/// Components of the averaged powers that the `1 / msp` power cannot take
/// back.
fn undefined_components(v: &Array1<f32>, msp: f32) -> usize {
    if msp == 1.0 {
        0
    } else {
        v.iter().filter(|x| **x < 0.0).count()
    }
}

/// `extract_ss` for `ms == [1]`, `extract_ms` otherwise.
pub(crate) fn extract_scales(
    net: &RetrievalNet,
    input: &Array4<f32>,
    ms: &[f32],
    msp: f32,
) -> Result<Array1<f32>, ExtractError> {
    if ms == [1.0] {
        extract_ss(net, input)
    } else {
        extract_ms(net, input, ms, msp)
    }
}
