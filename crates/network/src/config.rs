use layers::Mode;
use serde::{Deserialize, Serialize};

/// Options accepted by [`crate::init_network`]. Missing fields take the
/// defaults below, so an empty YAML mapping yields a pretrained resnet101
/// with GeM pooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub architecture: String,
    pub local_whitening: bool,
    pub pooling: String,
    /// Initial GeM power.
    pub p: f32,
    pub regional: bool,
    pub whitening: bool,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub pretrained: bool,
    /// Dataset the attention variant was trained on; informational.
    pub pretrained_type: String,
    /// Use the second-order-attention variant (resnet only).
    pub soa: bool,
    /// Stages followed by attention, as digits `2`-`5`.
    pub soa_layers: String,
    pub mode: Mode,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            architecture: "resnet101".into(),
            local_whitening: false,
            pooling: "gem".into(),
            p: 3.0,
            regional: false,
            whitening: false,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            pretrained: true,
            pretrained_type: "SfM120k".into(),
            soa: false,
            soa_layers: "45".into(),
            mode: Mode::Train,
        }
    }
}

impl NetworkConfig {
    pub fn for_architecture(architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            ..Self::default()
        }
    }
}
