//! Named parameter dictionaries.
//!
//! Parameter names follow dotted module paths (`features.0.weight`,
//! `whiten.bias`, `pool.p`) so that published state dicts map onto the
//! composed network without renaming.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayD, IxDyn};

use crate::LayerError;

/// Ordered map of parameter name to tensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Entries under `prefix.` with the prefix removed.
    pub fn sub(&self, prefix: &str) -> StateDict {
        let head = format!("{prefix}.");
        StateDict {
            tensors: self
                .tensors
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&head).map(|rest| (rest.to_string(), v.clone())))
                .collect(),
        }
    }

    /// Looks up `name` and checks its shape exactly.
    pub fn param(&self, name: &str, expected: &[usize]) -> Result<&ArrayD<f32>, LayerError> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| LayerError::MissingParameter(name.to_string()))?;
        if tensor.shape() != expected {
            return Err(LayerError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.shape().to_vec(),
            });
        }
        Ok(tensor)
    }

    pub fn param1(&self, name: &str, len: usize) -> Result<Array1<f32>, LayerError> {
        let tensor = self.param(name, &[len])?;
        Ok(Array1::from_iter(tensor.iter().copied()))
    }

    /// Loads a matrix stored under `stored_shape` (e.g. a `[out, in, 1, 1]`
    /// pointwise kernel) as `(rows, cols)`.
    pub fn param2(
        &self,
        name: &str,
        rows: usize,
        cols: usize,
        stored_shape: &[usize],
    ) -> Result<Array2<f32>, LayerError> {
        let tensor = self.param(name, stored_shape)?;
        Ok(Array2::from_shape_vec(
            (rows, cols),
            tensor.iter().copied().collect(),
        )?)
    }
}

impl FromIterator<(String, ArrayD<f32>)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// Joins a module prefix and a parameter name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Reshapes any array into a dynamic tensor of `shape`.
pub fn to_dyn<'a, I>(values: I, shape: &[usize]) -> ArrayD<f32>
where
    I: IntoIterator<Item = &'a f32>,
{
    ArrayD::from_shape_vec(IxDyn(shape), values.into_iter().copied().collect())
        .expect("parameter shape matches its element count")
}

/// Modules whose parameters can be exported to and restored from a [`StateDict`].
pub trait Stateful {
    /// Restores parameters found under `prefix`. Every parameter the module
    /// owns must be present with its exact shape.
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError>;

    /// Writes every parameter under `prefix` into `out`.
    fn export_state(&self, prefix: &str, out: &mut StateDict);

    fn state_dict(&self) -> StateDict {
        let mut out = StateDict::new();
        self.export_state("", &mut out);
        out
    }

    /// Strict load: no missing parameters, no unexpected ones, exact shapes.
    fn load_state_dict(&mut self, dict: &StateDict) -> Result<(), LayerError> {
        let own = self.state_dict();
        if let Some(extra) = dict.keys().find(|k| own.get(k).is_none()) {
            return Err(LayerError::UnexpectedParameter(extra.to_string()));
        }
        self.load_state(dict, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn param_checks_shape_exactly() {
        let mut dict = StateDict::new();
        dict.insert("weight", array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn());

        assert!(dict.param("weight", &[2, 2]).is_ok());
        assert!(matches!(
            dict.param("weight", &[4]),
            Err(LayerError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            dict.param("bias", &[2]),
            Err(LayerError::MissingParameter(_))
        ));
    }

    #[test]
    fn param2_reads_pointwise_kernel() {
        let mut dict = StateDict::new();
        dict.insert("w", to_dyn(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2, 1, 1]));
        let m = dict.param2("w", 3, 2, &[3, 2, 1, 1]).unwrap();
        assert_eq!(m, array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
    }

    #[test]
    fn sub_strips_prefix() {
        let mut dict = StateDict::new();
        dict.insert("features.0.weight", to_dyn(&[1.0], &[1]));
        dict.insert("features.0.bias", to_dyn(&[2.0], &[1]));
        dict.insert("whiten.weight", to_dyn(&[3.0], &[1]));

        let features = dict.sub("features");
        assert_eq!(features.len(), 2);
        assert!(features.get("0.weight").is_some());
        assert!(features.get("whiten.weight").is_none());
    }

    #[test]
    fn join_handles_empty_prefix() {
        assert_eq!(join("", "weight"), "weight");
        assert_eq!(join("pool.whiten", "bias"), "pool.whiten.bias");
    }
}
