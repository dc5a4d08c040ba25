//! # Retrieval network registry
//!
//! Static facts the network assembler consults: the descriptor dimensionality
//! produced by each supported backbone, and where pretrained artifacts
//! (substituted backbone features, local/regional/global whitening, complete
//! retrieval networks) can be fetched from.
//!
//! A [`Registry`] is a plain immutable value. Build it once at startup and
//! hand it to the assembler; nothing here reads ambient global state.
//!
//! ```
//! use registry::Registry;
//!
//! let registry = Registry::default();
//! assert_eq!(registry.output_dim("resnet101"), Some(2048));
//! assert!(registry.whitening(&Registry::whitening_key("resnet101", false, "gem", false)).is_some());
//! assert!(registry.output_dim("not-a-real-net").is_none());
//! ```
//!
//! Deployments that mirror artifacts elsewhere (or convert them to another
//! container format) layer a YAML overlay on top of the defaults with
//! [`Registry::with_overrides`].

mod tables;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Subdirectory of the data root where backbone and network artifacts are cached.
pub const NETWORKS_DIR: &str = "networks";
/// Subdirectory of the data root where whitening artifacts are cached.
pub const WHITEN_DIR: &str = "whiten";

/// Errors raised while reading a registry overlay.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry overlay: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse registry overlay: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid registry entry: {0}")]
    Invalid(String),
}

/// Immutable lookup tables for architectures and pretrained artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    output_dim: BTreeMap<String, usize>,
    features: BTreeMap<String, String>,
    local_whitening: BTreeMap<String, String>,
    regional_whitening: BTreeMap<String, String>,
    whitening: BTreeMap<String, String>,
    pretrained: BTreeMap<String, String>,
}

impl Default for Registry {
    fn default() -> Self {
        fn uris(table: &[(&str, &str)]) -> BTreeMap<String, String> {
            table
                .iter()
                .map(|(k, v)| ((*k).to_string(), tables::remote(v)))
                .collect()
        }

        Self {
            output_dim: tables::OUTPUT_DIM
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
            features: uris(tables::FEATURES),
            local_whitening: uris(tables::L_WHITENING),
            regional_whitening: uris(tables::R_WHITENING),
            whitening: uris(tables::WHITENING),
            pretrained: uris(tables::PRETRAINED),
        }
    }
}

impl Registry {
    /// A registry with no entries at all. Mostly useful in tests together
    /// with [`Registry::with_overrides`].
    pub fn empty() -> Self {
        Self {
            output_dim: BTreeMap::new(),
            features: BTreeMap::new(),
            local_whitening: BTreeMap::new(),
            regional_whitening: BTreeMap::new(),
            whitening: BTreeMap::new(),
            pretrained: BTreeMap::new(),
        }
    }

    /// Output (descriptor) dimensionality for `architecture`.
    ///
    /// This is the one required table: a miss means the architecture is
    /// unsupported.
    pub fn output_dim(&self, architecture: &str) -> Option<usize> {
        self.output_dim.get(architecture).copied()
    }

    /// Substituted backbone feature weights for `architecture`, if any.
    pub fn features(&self, architecture: &str) -> Option<&str> {
        self.features.get(architecture).map(String::as_str)
    }

    pub fn local_whitening(&self, architecture: &str) -> Option<&str> {
        self.local_whitening.get(architecture).map(String::as_str)
    }

    /// Regional whitening keyed by [`Registry::regional_key`].
    pub fn regional_whitening(&self, key: &str) -> Option<&str> {
        self.regional_whitening.get(key).map(String::as_str)
    }

    /// Global whitening keyed by [`Registry::whitening_key`].
    pub fn whitening(&self, key: &str) -> Option<&str> {
        self.whitening.get(key).map(String::as_str)
    }

    /// Complete pretrained retrieval network by name.
    pub fn pretrained_network(&self, name: &str) -> Option<&str> {
        self.pretrained.get(name).map(String::as_str)
    }

    /// Names of every architecture with an output-dimension entry, sorted.
    pub fn architectures(&self) -> impl Iterator<Item = &str> {
        self.output_dim.keys().map(String::as_str)
    }

    /// Names of every registered pretrained retrieval network, sorted.
    pub fn pretrained_networks(&self) -> impl Iterator<Item = &str> {
        self.pretrained.keys().map(String::as_str)
    }

    pub fn regional_key(architecture: &str, pooling: &str) -> String {
        format!("{architecture}-{pooling}-r")
    }

    pub fn whitening_key(
        architecture: &str,
        local_whitening: bool,
        pooling: &str,
        regional: bool,
    ) -> String {
        let mut key = architecture.to_string();
        if local_whitening {
            key.push_str("-lw");
        }
        key.push('-');
        key.push_str(pooling);
        if regional {
            key.push_str("-r");
        }
        key
    }

    /// Returns a new registry with `overrides` layered on top of `self`.
    /// Entries present in both are replaced by the overlay.
    pub fn with_overrides(mut self, overrides: RegistryOverrides) -> Self {
        self.output_dim.extend(overrides.output_dim);
        self.features.extend(overrides.features);
        self.local_whitening.extend(overrides.local_whitening);
        self.regional_whitening.extend(overrides.regional_whitening);
        self.whitening.extend(overrides.whitening);
        self.pretrained.extend(overrides.pretrained);
        self
    }
}

/// Additional or replacement registry entries, usually read from YAML.
///
/// ```yaml
/// output_dim:
///   resnet101: 2048
/// whitening:
///   resnet101-gem: file:///srv/artifacts/resnet101-gem-whiten.safetensors
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryOverrides {
    pub output_dim: BTreeMap<String, usize>,
    pub features: BTreeMap<String, String>,
    pub local_whitening: BTreeMap<String, String>,
    pub regional_whitening: BTreeMap<String, String>,
    pub whitening: BTreeMap<String, String>,
    pub pretrained: BTreeMap<String, String>,
}

impl RegistryOverrides {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, RegistryError> {
        let overrides: RegistryOverrides = serde_yaml::from_str(yaml)?;
        overrides.validate()?;
        Ok(overrides)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if let Some((name, _)) = self.output_dim.iter().find(|(_, dim)| **dim == 0) {
            return Err(RegistryError::Invalid(format!(
                "output_dim for '{name}' must be >= 1"
            )));
        }
        let uri_tables = [
            &self.features,
            &self.local_whitening,
            &self.regional_whitening,
            &self.whitening,
            &self.pretrained,
        ];
        for table in uri_tables {
            if let Some((name, _)) = table.iter().find(|(_, uri)| uri.trim().is_empty()) {
                return Err(RegistryError::Invalid(format!(
                    "artifact location for '{name}' is empty"
                )));
            }
        }
        Ok(())
    }
}
