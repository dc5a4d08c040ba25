//! Global pooling operators: spatial feature map `(B, C, H, W)` to one
//! `C`-dimensional vector per image.
//!
//! Any base operator can be made regional with [`Rpool`], which pools every
//! R-MAC style region separately, whitens each region vector and sums them.

use std::fmt;
use std::str::FromStr;

use ndarray::{s, Array1, Array2, ArrayView2, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::linear::Linear;
use crate::normalize::l2_normalize_eps;
use crate::state::{join, to_dyn, StateDict, Stateful};
use crate::LayerError;

const POOL_EPS: f32 = 1e-6;
/// Number of region scales used by R-MAC and regional pooling.
pub const RMAC_LEVELS: usize = 3;

/// Pooling names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingKind {
    Mac,
    Spoc,
    Gem,
    Gemmp,
    Rmac,
}

impl PoolingKind {
    pub const ALL: [PoolingKind; 5] = [
        PoolingKind::Mac,
        PoolingKind::Spoc,
        PoolingKind::Gem,
        PoolingKind::Gemmp,
        PoolingKind::Rmac,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PoolingKind::Mac => "mac",
            PoolingKind::Spoc => "spoc",
            PoolingKind::Gem => "gem",
            PoolingKind::Gemmp => "gemmp",
            PoolingKind::Rmac => "rmac",
        }
    }
}

impl fmt::Display for PoolingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolingKind {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PoolingKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| LayerError::UnknownPooling(s.to_string()))
    }
}

/// A constructed pooling operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Pooling {
    /// Max over all positions.
    Mac,
    /// Average over all positions.
    Spoc,
    /// Generalized mean with a single power.
    Gem { p: f32 },
    /// Generalized mean with one power per channel.
    GemMp { p: Array1<f32> },
    /// Sum of l2-normalized max-pooled regions.
    Rmac { levels: usize },
    Regional(Box<Rpool>),
}

impl Pooling {
    /// Builds the operator named by `kind`. `p` is the initial GeM power and
    /// `dim` the channel count, used only by the per-channel variant.
    pub fn new(kind: PoolingKind, p: f32, dim: usize) -> Self {
        match kind {
            PoolingKind::Mac => Pooling::Mac,
            PoolingKind::Spoc => Pooling::Spoc,
            PoolingKind::Gem => Pooling::Gem { p },
            PoolingKind::Gemmp => Pooling::GemMp {
                p: Array1::from_elem(dim, p),
            },
            PoolingKind::Rmac => Pooling::Rmac {
                levels: RMAC_LEVELS,
            },
        }
    }

    /// Wraps `self` into a regional operator with per-region whitening.
    pub fn regional(self, whiten: Option<Linear>) -> Self {
        Pooling::Regional(Box::new(Rpool {
            rpool: self,
            whiten,
            levels: RMAC_LEVELS,
        }))
    }

    pub fn name(&self) -> String {
        match self {
            Pooling::Mac => "mac".into(),
            Pooling::Spoc => "spoc".into(),
            Pooling::Gem { .. } => "gem".into(),
            Pooling::GemMp { .. } => "gemmp".into(),
            Pooling::Rmac { .. } => "rmac".into(),
            Pooling::Regional(inner) => format!("{}-r", inner.rpool.name()),
        }
    }

    /// Current power parameter for the GeM variants (mean power for `gemmp`).
    pub fn p(&self) -> Option<f32> {
        match self {
            Pooling::Gem { p } => Some(*p),
            Pooling::GemMp { p } => p.mean(),
            Pooling::Regional(inner) => inner.rpool.p(),
            _ => None,
        }
    }

    pub fn forward(&self, x: ArrayView4<'_, f32>) -> Result<Array2<f32>, LayerError> {
        let (_, channels, h, w) = x.dim();
        if h == 0 || w == 0 {
            return Err(LayerError::InputTooSmall {
                layer: self.name(),
                height: h,
                width: w,
            });
        }
        if let Pooling::GemMp { p } = self {
            if p.len() != channels {
                return Err(LayerError::ChannelMismatch {
                    layer: "gemmp".into(),
                    expected: p.len(),
                    actual: channels,
                });
            }
        }
        Ok(match self {
            Pooling::Mac => reduce_planes(x, |plane| plane.fold(f32::NEG_INFINITY, |m, &v| m.max(v))),
            Pooling::Spoc => reduce_planes(x, |plane| plane.mean().unwrap_or(0.0)),
            Pooling::Gem { p } => reduce_planes(x, |plane| gem(plane, *p)),
            Pooling::GemMp { p } => {
                let mut out = Array2::zeros((x.dim().0, channels));
                for ((b, c), slot) in out.indexed_iter_mut() {
                    *slot = gem(x.slice(s![b, c, .., ..]), p[c]);
                }
                out
            }
            Pooling::Rmac { levels } => rmac(x, *levels),
            Pooling::Regional(inner) => inner.forward(x)?,
        })
    }
}

impl Stateful for Pooling {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        match self {
            Pooling::Gem { p } => {
                *p = dict.param1(&join(prefix, "p"), 1)?[0];
            }
            Pooling::GemMp { p } => {
                *p = dict.param1(&join(prefix, "p"), p.len())?;
            }
            Pooling::Regional(inner) => inner.load_state(dict, prefix)?,
            Pooling::Mac | Pooling::Spoc | Pooling::Rmac { .. } => {}
        }
        Ok(())
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        match self {
            Pooling::Gem { p } => out.insert(join(prefix, "p"), to_dyn([*p].iter(), &[1])),
            Pooling::GemMp { p } => out.insert(join(prefix, "p"), to_dyn(p.iter(), &[p.len()])),
            Pooling::Regional(inner) => inner.export_state(prefix, out),
            Pooling::Mac | Pooling::Spoc | Pooling::Rmac { .. } => {}
        }
    }
}

/// Regional pooling: the base operator is applied to the whole map and to
/// every region, each region vector is normalized, optionally whitened and
/// re-normalized, and all region vectors are summed.
#[derive(Debug, Clone, PartialEq)]
pub struct Rpool {
    pub rpool: Pooling,
    pub whiten: Option<Linear>,
    pub levels: usize,
}

impl Rpool {
    fn forward(&self, x: ArrayView4<'_, f32>) -> Result<Array2<f32>, LayerError> {
        let (_, _, h, w) = x.dim();
        let mut total = self.region_vector(x)?;
        for r in rmac_regions(h, w, self.levels) {
            let view = x.slice(s![.., .., r.top..r.top + r.size, r.left..r.left + r.size]);
            total += &self.region_vector(view)?;
        }
        Ok(total)
    }

    fn region_vector(&self, x: ArrayView4<'_, f32>) -> Result<Array2<f32>, LayerError> {
        let mut vecs = self.rpool.forward(x)?;
        normalize_rows_eps(&mut vecs);
        if let Some(whiten) = &self.whiten {
            vecs = whiten.forward(vecs.view())?;
            normalize_rows_eps(&mut vecs);
        }
        Ok(vecs)
    }
}

impl Stateful for Rpool {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        self.rpool.load_state(dict, &join(prefix, "rpool"))?;
        if let Some(whiten) = &mut self.whiten {
            whiten.load_state(dict, &join(prefix, "whiten"))?;
        }
        Ok(())
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        self.rpool.export_state(&join(prefix, "rpool"), out);
        if let Some(whiten) = &self.whiten {
            whiten.export_state(&join(prefix, "whiten"), out);
        }
    }
}

/// A square region of the feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub top: usize,
    pub left: usize,
    pub size: usize,
}

/// R-MAC region grid over an `h x w` map for `levels` scales.
///
/// At scale `l` the square side is `floor(2 * min(h, w) / (l + 1))`; the long
/// side gets extra regions so that neighbours overlap by roughly 40%.
pub fn rmac_regions(h: usize, w: usize, levels: usize) -> Vec<Region> {
    const OVERLAP: f64 = 0.4;
    const STEPS: [f64; 6] = [2.0, 3.0, 4.0, 5.0, 6.0, 7.0];

    let (hf, wf) = (h as f64, w as f64);
    let short = hf.min(wf);
    let long = hf.max(wf);

    let mut best = 0;
    let mut best_err = f64::INFINITY;
    for (idx, step) in STEPS.iter().enumerate() {
        let b = (long - short) / (step - 1.0);
        let err = ((short * short - short * b) / (short * short) - OVERLAP).abs();
        if err < best_err {
            best_err = err;
            best = idx;
        }
    }
    let (wd, hd) = match h.cmp(&w) {
        std::cmp::Ordering::Less => (best + 1, 0),
        std::cmp::Ordering::Greater => (0, best + 1),
        std::cmp::Ordering::Equal => (0, 0),
    };

    let centers = |extent: f64, wl: f64, wl2: f64, extra: usize, l: usize| -> Vec<i64> {
        let count = l + extra;
        let b = if count == 1 {
            0.0
        } else {
            (extent - wl) / (count - 1) as f64
        };
        (0..count)
            .map(|k| ((wl2 + k as f64 * b).floor() - wl2) as i64)
            .collect()
    };

    let mut regions = Vec::new();
    for l in 1..=levels {
        let wl = (2.0 * short / (l as f64 + 1.0)).floor();
        if wl < 1.0 {
            continue;
        }
        let wl2 = (wl / 2.0 - 1.0).floor();
        let size = wl as usize;
        for top in centers(hf, wl, wl2, hd, l) {
            for left in centers(wf, wl, wl2, wd, l) {
                if top < 0 || left < 0 {
                    continue;
                }
                let (top, left) = (top as usize, left as usize);
                if top + size <= h && left + size <= w {
                    regions.push(Region { top, left, size });
                }
            }
        }
    }
    regions
}

fn reduce_planes<F>(x: ArrayView4<'_, f32>, f: F) -> Array2<f32>
where
    F: Fn(ArrayView2<'_, f32>) -> f32,
{
    let (b, c, _, _) = x.dim();
    let mut out = Array2::zeros((b, c));
    for ((bi, ci), slot) in out.indexed_iter_mut() {
        *slot = f(x.slice(s![bi, ci, .., ..]));
    }
    out
}

fn gem(plane: ArrayView2<'_, f32>, p: f32) -> f32 {
    let n = plane.len() as f32;
    let mean = plane.iter().map(|v| v.max(POOL_EPS).powf(p)).sum::<f32>() / n;
    mean.powf(p.recip())
}

fn rmac(x: ArrayView4<'_, f32>, levels: usize) -> Array2<f32> {
    let (_, _, h, w) = x.dim();
    let max = |view: ArrayView4<'_, f32>| {
        let mut v = reduce_planes(view, |plane| plane.fold(f32::NEG_INFINITY, |m, &v| m.max(v)));
        normalize_rows_eps(&mut v);
        v
    };
    let mut acc = max(x);
    for r in rmac_regions(h, w, levels) {
        acc += &max(x.slice(s![.., .., r.top..r.top + r.size, r.left..r.left + r.size]));
    }
    acc
}

fn normalize_rows_eps(x: &mut Array2<f32>) {
    for row in x.axis_iter_mut(Axis(0)) {
        l2_normalize_eps(row, POOL_EPS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array4};

    fn map(b: usize, c: usize, h: usize, w: usize) -> Array4<f32> {
        Array::from_shape_fn((b, c, h, w), |(bi, ci, hi, wi)| {
            ((bi + 1) * (ci + 1)) as f32 * 0.1 + (hi * w + wi) as f32 * 0.01
        })
    }

    #[test]
    fn kind_parsing() {
        assert_eq!("gem".parse::<PoolingKind>().unwrap(), PoolingKind::Gem);
        assert_eq!("gemmp".parse::<PoolingKind>().unwrap(), PoolingKind::Gemmp);
        assert!(matches!(
            "avg".parse::<PoolingKind>(),
            Err(LayerError::UnknownPooling(_))
        ));
    }

    #[test]
    fn mac_takes_maximum() {
        let x = map(1, 2, 3, 3);
        let y = Pooling::Mac.forward(x.view()).unwrap();
        assert!((y[(0, 0)] - (0.1 + 0.08)).abs() < 1e-6);
        assert!((y[(0, 1)] - (0.2 + 0.08)).abs() < 1e-6);
    }

    #[test]
    fn spoc_takes_mean() {
        let x = map(1, 1, 2, 2);
        let y = Pooling::Spoc.forward(x.view()).unwrap();
        assert!((y[(0, 0)] - (0.1 + 0.015)).abs() < 1e-6);
    }

    #[test]
    fn gem_interpolates_between_mean_and_max() {
        let x = map(2, 3, 4, 4);
        let spoc = Pooling::Spoc.forward(x.view()).unwrap();
        let mac = Pooling::Mac.forward(x.view()).unwrap();
        let gem = Pooling::new(PoolingKind::Gem, 3.0, 3).forward(x.view()).unwrap();
        for ((g, s), m) in gem.iter().zip(spoc.iter()).zip(mac.iter()) {
            assert!(*g >= s - 1e-6 && *g <= m + 1e-6, "{s} <= {g} <= {m}");
        }
        let gem1 = Pooling::Gem { p: 1.0 }.forward(x.view()).unwrap();
        for (a, b) in gem1.iter().zip(spoc.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn gemmp_matches_gem_with_uniform_powers() {
        let x = map(1, 4, 3, 5);
        let gem = Pooling::Gem { p: 3.0 }.forward(x.view()).unwrap();
        let gemmp = Pooling::new(PoolingKind::Gemmp, 3.0, 4).forward(x.view()).unwrap();
        for (a, b) in gem.iter().zip(gemmp.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn gemmp_rejects_channel_mismatch() {
        let x = map(1, 4, 3, 3);
        let pool = Pooling::new(PoolingKind::Gemmp, 3.0, 8);
        assert!(matches!(
            pool.forward(x.view()),
            Err(LayerError::ChannelMismatch { .. })
        ));
    }

    #[test]
    fn regions_for_square_map() {
        let regions = rmac_regions(7, 7, 3);
        // level 1: one 7x7, level 2: 2x2 grid of 4x4, level 3: 3x3 grid of 3x3
        assert_eq!(regions.len(), 1 + 4 + 9);
        assert_eq!(regions[0], Region { top: 0, left: 0, size: 7 });
        assert!(regions.iter().all(|r| r.top + r.size <= 7 && r.left + r.size <= 7));
    }

    #[test]
    fn regions_for_wide_map_add_columns() {
        let regions = rmac_regions(6, 12, 3);
        let level1: Vec<_> = regions.iter().filter(|r| r.size == 6).collect();
        assert!(level1.len() > 1, "long side gets extra level-1 regions");
        assert!(level1.iter().all(|r| r.top == 0));
        assert!(regions.iter().all(|r| r.left + r.size <= 12));
    }

    #[test]
    fn regions_for_single_cell() {
        assert_eq!(rmac_regions(1, 1, 3), vec![Region { top: 0, left: 0, size: 1 }]);
    }

    #[test]
    fn rmac_sums_normalized_regions() {
        let x = map(1, 3, 5, 5);
        let y = Pooling::new(PoolingKind::Rmac, 3.0, 3).forward(x.view()).unwrap();
        let regions = 1 + rmac_regions(5, 5, RMAC_LEVELS).len();
        let norm = y.row(0).iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!(norm > 1.0 && norm <= regions as f32 + 1e-4);
    }

    #[test]
    fn regional_wrapper_names_and_state() {
        let mut rng = fastrand::Rng::with_seed(11);
        let pool = Pooling::new(PoolingKind::Gem, 3.0, 4).regional(Some(Linear::random(4, 4, &mut rng)));
        assert_eq!(pool.name(), "gem-r");
        assert_eq!(pool.p(), Some(3.0));

        let state = pool.state_dict();
        let keys: Vec<&str> = state.keys().collect();
        assert_eq!(keys, vec!["rpool.p", "whiten.bias", "whiten.weight"]);

        let y = pool.forward(map(2, 4, 6, 6).view()).unwrap();
        assert_eq!(y.dim(), (2, 4));
    }

    #[test]
    fn gem_state_roundtrip() {
        let mut pool = Pooling::Gem { p: 3.0 };
        let mut dict = StateDict::new();
        dict.insert("p", to_dyn([2.5f32].iter(), &[1]));
        pool.load_state_dict(&dict).unwrap();
        assert_eq!(pool.p(), Some(2.5));
    }

    #[test]
    fn empty_map_is_rejected() {
        let x = Array4::<f32>::zeros((1, 2, 0, 3));
        assert!(matches!(
            Pooling::Mac.forward(x.view()),
            Err(LayerError::InputTooSmall { .. })
        ));
    }
}
