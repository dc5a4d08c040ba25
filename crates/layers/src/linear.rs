use ndarray::{Array1, Array2, ArrayView2};

use crate::state::{join, to_dyn, StateDict, Stateful};
use crate::LayerError;

/// Affine map `y = x W^T + b` used for local, regional and global whitening.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    /// `(out_features, in_features)`
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    /// Uniform `±1/sqrt(in_features)` initialization for weight and bias.
    pub fn random(in_features: usize, out_features: usize, rng: &mut fastrand::Rng) -> Self {
        let bound = (in_features as f32).sqrt().recip();
        let mut sample = || (rng.f32() * 2.0 - 1.0) * bound;
        let weight = Array2::from_shape_simple_fn((out_features, in_features), &mut sample);
        let bias = Array1::from_shape_simple_fn(out_features, &mut sample);
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Applies the map to every row of `x`.
    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>, LayerError> {
        if x.ncols() != self.in_features() {
            return Err(LayerError::ChannelMismatch {
                layer: "linear".into(),
                expected: self.in_features(),
                actual: x.ncols(),
            });
        }
        let mut y = x.dot(&self.weight.t());
        y += &self.bias;
        Ok(y)
    }
}

impl Stateful for Linear {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        let (out, inp) = self.weight.dim();
        let weight = dict.param2(&join(prefix, "weight"), out, inp, &[out, inp])?;
        let bias = dict.param1(&join(prefix, "bias"), out)?;
        self.weight = weight;
        self.bias = bias;
        Ok(())
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        let (o, i) = self.weight.dim();
        out.insert(join(prefix, "weight"), to_dyn(self.weight.iter(), &[o, i]));
        out.insert(join(prefix, "bias"), to_dyn(self.bias.iter(), &[o]));
    }
}
