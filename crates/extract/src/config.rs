use serde::{Deserialize, Serialize};

use crate::ExtractError;

/// Extraction knobs shared by every driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Longest image side after resizing; smaller images are left alone.
    pub image_size: u32,
    /// Scale factors. `[1.0]` means single-scale extraction.
    pub ms: Vec<f32>,
    /// Power used to combine scales. Values other than `1` assume
    /// non-negative descriptors; whitened networks yield NaN components.
    pub msp: f32,
    /// Log progress every this many images; `0` only logs the final count.
    pub print_freq: usize,
    /// Images decoded ahead of the network.
    pub num_workers: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            image_size: 1024,
            ms: vec![1.0],
            msp: 1.0,
            print_freq: 10,
            num_workers: 8,
        }
    }
}

impl ExtractConfig {
    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.image_size == 0 {
            return Err(ExtractError::InvalidConfig("image_size must be >= 1".into()));
        }
        if self.ms.is_empty() {
            return Err(ExtractError::InvalidConfig("ms must list at least one scale".into()));
        }
        if let Some(s) = self.ms.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(ExtractError::InvalidConfig(format!("invalid scale {s}")));
        }
        if !(self.msp.is_finite() && self.msp > 0.0) {
            return Err(ExtractError::InvalidConfig(format!(
                "msp must be positive, got {}",
                self.msp
            )));
        }
        Ok(())
    }

    /// `true` when extraction runs at the original resolution only.
    pub fn is_single_scale(&self) -> bool {
        self.ms == [1.0]
    }
}
