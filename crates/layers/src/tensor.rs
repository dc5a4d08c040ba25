//! Layout helpers shared by the layers.
//!
//! Feature maps are `Array4<f32>` in `(batch, channels, height, width)`
//! order; pooled descriptors are `Array2<f32>` with one row per image.

use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};

use crate::LayerError;

/// Training/inference switch carried by models and attention extractors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Train,
    #[serde(alias = "eval")]
    Test,
}

impl Mode {
    pub fn is_train(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Flattens every spatial position into its own row: `(B, C, H, W)` becomes
/// `(B * H * W, C)`, ordered batch-major then row-major over positions.
pub fn positions_to_rows(x: &Array4<f32>) -> Array2<f32> {
    let (b, c, h, w) = x.dim();
    let permuted = x.view().permuted_axes([0, 2, 3, 1]);
    Array2::from_shape_vec((b * h * w, c), permuted.iter().copied().collect())
        .expect("row count matches element count")
}

/// Inverse of [`positions_to_rows`] for a possibly different channel count.
pub fn rows_to_positions(
    rows: Array2<f32>,
    batch: usize,
    height: usize,
    width: usize,
) -> Result<Array4<f32>, LayerError> {
    let channels = rows.ncols();
    let data: Vec<f32> = rows.iter().copied().collect();
    let nhwc = Array4::from_shape_vec((batch, height, width, channels), data)?;
    Ok(nhwc
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned())
}

/// Bilinear resize by `scale` without corner alignment.
///
/// The output size is `floor(dim * scale)`. Source coordinates follow
/// `(dst + 0.5) / scale - 0.5`, clamped at zero, so published multi-scale
/// descriptors are reproduced.
pub fn interpolate_bilinear(x: &Array4<f32>, scale: f32) -> Result<Array4<f32>, LayerError> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(LayerError::InvalidScale(scale));
    }
    let (b, c, in_h, in_w) = x.dim();
    let out_h = (in_h as f64 * scale as f64).floor() as usize;
    let out_w = (in_w as f64 * scale as f64).floor() as usize;
    if out_h == 0 || out_w == 0 || in_h == 0 || in_w == 0 {
        return Err(LayerError::InputTooSmall {
            layer: format!("bilinear resize x{scale}"),
            height: in_h,
            width: in_w,
        });
    }

    let inv = 1.0 / scale as f64;
    let source = |dst: usize, max: usize| -> (usize, usize, f32) {
        let src = ((dst as f64 + 0.5) * inv - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(max);
        let i1 = (i0 + 1).min(max);
        let frac = (src - i0 as f64).clamp(0.0, 1.0) as f32;
        (i0, i1, frac)
    };
    let ys: Vec<_> = (0..out_h).map(|h| source(h, in_h - 1)).collect();
    let xs: Vec<_> = (0..out_w).map(|w| source(w, in_w - 1)).collect();

    let mut out = Array4::<f32>::zeros((b, c, out_h, out_w));
    for bi in 0..b {
        for ci in 0..c {
            let plane = x.slice(ndarray::s![bi, ci, .., ..]);
            for (oh, &(y0, y1, ly)) in ys.iter().enumerate() {
                for (ow, &(x0, x1, lx)) in xs.iter().enumerate() {
                    let top = plane[(y0, x0)] * (1.0 - lx) + plane[(y0, x1)] * lx;
                    let bottom = plane[(y1, x0)] * (1.0 - lx) + plane[(y1, x1)] * lx;
                    out[(bi, ci, oh, ow)] = top * (1.0 - ly) + bottom * ly;
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn ramp(b: usize, c: usize, h: usize, w: usize) -> Array4<f32> {
        Array::from_shape_fn((b, c, h, w), |(bi, ci, hi, wi)| {
            (bi * 1000 + ci * 100 + hi * 10 + wi) as f32
        })
    }

    #[test]
    fn rows_roundtrip_preserves_layout() {
        let x = ramp(2, 3, 4, 5);
        let rows = positions_to_rows(&x);
        assert_eq!(rows.dim(), (2 * 4 * 5, 3));
        // first row holds every channel at (b=0, h=0, w=0)
        assert_eq!(rows[(0, 0)], 0.0);
        assert_eq!(rows[(0, 1)], 100.0);
        assert_eq!(rows[(0, 2)], 200.0);
        // second row is the next column
        assert_eq!(rows[(1, 0)], 1.0);

        let back = rows_to_positions(rows, 2, 4, 5).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn bilinear_identity_scale() {
        let x = ramp(1, 2, 6, 7);
        let y = interpolate_bilinear(&x, 1.0).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn bilinear_half_scale_averages_pairs() {
        let x = ramp(1, 1, 4, 4);
        let y = interpolate_bilinear(&x, 0.5).unwrap();
        assert_eq!(y.dim(), (1, 1, 2, 2));
        // src = 2*dst + 0.5 -> midpoint between neighbours
        assert!((y[(0, 0, 0, 0)] - 5.5).abs() < 1e-5);
        assert!((y[(0, 0, 1, 1)] - 27.5).abs() < 1e-5);
    }

    #[test]
    fn bilinear_upscale_clamps_edges() {
        let x = ramp(1, 1, 2, 2);
        let y = interpolate_bilinear(&x, 2.0).unwrap();
        assert_eq!(y.dim(), (1, 1, 4, 4));
        assert_eq!(y[(0, 0, 0, 0)], 0.0);
        assert_eq!(y[(0, 0, 3, 3)], 11.0);
    }

    #[test]
    fn bilinear_rejects_degenerate_scales() {
        let x = ramp(1, 1, 3, 3);
        assert!(matches!(
            interpolate_bilinear(&x, 0.0),
            Err(LayerError::InvalidScale(_))
        ));
        assert!(matches!(
            interpolate_bilinear(&x, 0.1),
            Err(LayerError::InputTooSmall { .. })
        ));
    }

    #[test]
    fn mode_parses_eval_alias() {
        let mode: Mode = serde_json::from_str("\"eval\"").unwrap();
        assert_eq!(mode, Mode::Test);
        assert!(Mode::default().is_train());
    }
}
