//! Second-order spatial attention inserted after selected resnet stages.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{Array2, Array4, Axis};

use crate::backbone::{Conv, FeatureExtractor, Sequential};
use crate::state::{join, StateDict, Stateful};
use crate::tensor::Mode;
use crate::LayerError;

/// Non-local block: every position attends to every other position of the
/// same image, and the attended values are added back residually.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondOrderAttention {
    pub query: Conv,
    pub key: Conv,
    pub value: Conv,
    pub out: Conv,
}

impl SecondOrderAttention {
    pub fn new(channels: usize, rng: &mut fastrand::Rng) -> Self {
        let inner = (channels / 2).max(1);
        Self {
            query: Conv::kaiming(channels, inner, true, rng),
            key: Conv::kaiming(channels, inner, true, rng),
            value: Conv::kaiming(channels, inner, true, rng),
            out: Conv::kaiming(inner, channels, true, rng),
        }
    }

    pub fn channels(&self) -> usize {
        self.query.in_channels()
    }

    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, LayerError> {
        let (b, _, h, w) = x.dim();
        let q = self.query.forward(x)?;
        let k = self.key.forward(x)?;
        let v = self.value.forward(x)?;
        let inner = q.dim().1;

        let mut attended = Array4::zeros((b, inner, h, w));
        for bi in 0..b {
            let flat = |t: &Array4<f32>| -> Result<Array2<f32>, LayerError> {
                Ok(t.index_axis(Axis(0), bi)
                    .to_shape((inner, h * w))?
                    .into_owned())
            };
            let (q, k, v) = (flat(&q)?, flat(&k)?, flat(&v)?);
            // (N, N) affinities, softmax over keys
            let mut affinity = q.t().dot(&k);
            for mut row in affinity.axis_iter_mut(Axis(0)) {
                let max = row.fold(f32::NEG_INFINITY, |m, &a| m.max(a));
                row.mapv_inplace(|a| (a - max).exp());
                let sum = row.sum();
                row.mapv_inplace(|a| a / sum);
            }
            let y = v.dot(&affinity.t());
            attended
                .index_axis_mut(Axis(0), bi)
                .assign(&y.into_shape_with_order((inner, h, w))?);
        }
        Ok(x + &self.out.forward(&attended)?)
    }
}

impl Stateful for SecondOrderAttention {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        self.query.load_state(dict, &join(prefix, "query"))?;
        self.key.load_state(dict, &join(prefix, "key"))?;
        self.value.load_state(dict, &join(prefix, "value"))?;
        self.out.load_state(dict, &join(prefix, "out"))
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        self.query.export_state(&join(prefix, "query"), out);
        self.key.export_state(&join(prefix, "key"), out);
        self.value.export_state(&join(prefix, "value"), out);
        self.out.export_state(&join(prefix, "out"), out);
    }
}

/// Resnet trunk with second-order attention after the stages listed in
/// `soa_layers` (digits `2`-`5`, naming `conv2_x`..`conv5_x`).
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionExtractor {
    trunk: Sequential,
    /// Keyed by the trunk child index the block runs after.
    blocks: BTreeMap<usize, (char, SecondOrderAttention)>,
    soa_layers: String,
}

impl AttentionExtractor {
    /// Trunk child index of stage `conv{d}_x` in a stripped resnet.
    fn stage_index(digit: char) -> Option<usize> {
        match digit {
            '2'..='5' => digit.to_digit(10).map(|d| d as usize + 2),
            _ => None,
        }
    }

    pub fn new(
        trunk: Sequential,
        soa_layers: &str,
        rng: &mut fastrand::Rng,
    ) -> Result<Self, LayerError> {
        let invalid = || LayerError::InvalidAttentionLayers(soa_layers.to_string());
        let mut blocks = BTreeMap::new();
        for digit in soa_layers.chars() {
            let index = Self::stage_index(digit).ok_or_else(invalid)?;
            if index >= trunk.len() {
                return Err(invalid());
            }
            let channels = trunk.channels_after(index).ok_or_else(invalid)?;
            blocks.insert(index, (digit, SecondOrderAttention::new(channels, rng)));
        }
        Ok(Self {
            trunk,
            blocks,
            soa_layers: soa_layers.to_string(),
        })
    }

    pub fn soa_layers(&self) -> &str {
        &self.soa_layers
    }
}

impl Stateful for AttentionExtractor {
    fn load_state(&mut self, dict: &StateDict, prefix: &str) -> Result<(), LayerError> {
        self.trunk.load_state(dict, prefix)?;
        for (digit, block) in self.blocks.values_mut() {
            block.load_state(dict, &join(prefix, &format!("soa{digit}")))?;
        }
        Ok(())
    }

    fn export_state(&self, prefix: &str, out: &mut StateDict) {
        self.trunk.export_state(prefix, out);
        for (digit, block) in self.blocks.values() {
            block.export_state(&join(prefix, &format!("soa{digit}")), out);
        }
    }
}

impl FeatureExtractor for AttentionExtractor {
    fn forward(&self, x: &Array4<f32>, mode: Mode) -> Result<Array4<f32>, LayerError> {
        let mut out = x.clone();
        for index in 0..self.trunk.len() {
            out = self.trunk.forward_child(index, &out, mode)?;
            if let Some((_, block)) = self.blocks.get(&index) {
                out = block.forward(&out)?;
            }
        }
        Ok(out)
    }

    fn out_channels(&self) -> Option<usize> {
        self.trunk.out_channels()
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for AttentionExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.trunk)?;
        for (index, (digit, block)) in &self.blocks {
            writeln!(
                f,
                "(soa{digit}): SecondOrderAttention({}) after ({index})",
                block.channels()
            )?;
        }
        Ok(())
    }
}
