use ndarray::{Array2, ArrayViewMut1, Axis};

/// In-place L2 normalization of a single vector. Zero vectors stay zero.
pub fn l2_normalize_in_place(mut v: ArrayViewMut1<'_, f32>) {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    if norm_sq > 0.0 {
        let inv_norm = norm_sq.sqrt().recip();
        v.mapv_inplace(|x| x * inv_norm);
    }
}

/// L2 normalization with an additive epsilon in the denominator, used when
/// aggregating region vectors.
pub fn l2_normalize_eps(mut v: ArrayViewMut1<'_, f32>, eps: f32) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let inv = (norm + eps).recip();
    v.mapv_inplace(|x| x * inv);
}

/// Row-wise unit-norm operator applied after pooling and after whitening.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct L2N;

impl L2N {
    pub fn forward(&self, mut x: Array2<f32>) -> Array2<f32> {
        for row in x.axis_iter_mut(Axis(0)) {
            l2_normalize_in_place(row);
        }
        x
    }
}

/// Signed square-root normalization, `sign(x + eps) * sqrt(|x + eps|)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerLaw {
    pub eps: f32,
}

impl Default for PowerLaw {
    fn default() -> Self {
        Self { eps: 1e-6 }
    }
}

impl PowerLaw {
    pub fn forward(&self, x: Array2<f32>) -> Array2<f32> {
        x.mapv_into(|v| {
            let shifted = v + self.eps;
            shifted.abs().sqrt().copysign(shifted)
        })
    }
}
