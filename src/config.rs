//! YAML run configuration for irnet.
//!
//! One file describes which network to build, where pretrained artifacts
//! are cached and how descriptors are extracted.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//! name: "holidays"
//!
//! # Either a registered pretrained network by name ...
//! pretrained_network: "gl18-tl-resnet101-gem-w"
//!
//! # ... or an assembly recipe.
//! network:
//!   architecture: "resnet101"
//!   pooling: "gem"
//!   whitening: true
//!   pretrained: true
//!
//! extract:
//!   image_size: 1024
//!   ms: [1.0, 0.707, 0.5]
//!   msp: 1.0
//!   print_freq: 10
//!   num_workers: 8
//!
//! data:
//!   root: "data"
//!   offline: false
//!
//! registry:
//!   whitening:
//!     resnet101-gem: "file:///srv/artifacts/resnet101-gem-whiten.safetensors"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use artifacts::CachedFetcher;
use extract::ExtractConfig;
use layers::PoolingKind;
use network::{NetworkConfig, NetworkError, RetrievalNet, init_network, load_pretrained_network};
use registry::{Registry, RegistryOverrides};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors that can occur when loading YAML configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Top-level YAML configuration for an extraction run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IrnetConfig {
    /// Configuration format version
    pub version: String,

    /// Optional run name, used to name feature files
    #[serde(default)]
    pub name: Option<String>,

    /// Registered pretrained network to load instead of assembling `network`
    #[serde(default)]
    pub pretrained_network: Option<String>,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub extract: ExtractConfig,

    #[serde(default)]
    pub data: DataConfig,

    /// Extra or replacement registry entries
    #[serde(default)]
    pub registry: Option<RegistryOverrides>,
}

impl IrnetConfig {
    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: IrnetConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigLoadError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        if let Some(name) = &self.pretrained_network {
            if name.trim().is_empty() {
                return Err(ConfigLoadError::Validation(
                    "pretrained_network must not be empty".to_string(),
                ));
            }
        }
        validate_network(&self.network)?;
        self.extract
            .validate()
            .map_err(|err| ConfigLoadError::Validation(format!("extract: {err}")))?;
        if let Some(overrides) = &self.registry {
            overrides
                .validate()
                .map_err(|err| ConfigLoadError::Validation(format!("registry: {err}")))?;
        }
        Ok(())
    }

    /// Built-in registry with this configuration's overlay applied.
    pub fn registry(&self) -> Registry {
        match &self.registry {
            Some(overrides) => Registry::default().with_overrides(overrides.clone()),
            None => Registry::default(),
        }
    }

    pub fn fetcher(&self) -> CachedFetcher {
        CachedFetcher::new(&self.data.root).offline(self.data.offline)
    }

    /// Loads the named pretrained network when one is configured, and
    /// assembles `network` otherwise.
    pub fn build_network(&self) -> Result<RetrievalNet, NetworkError> {
        let registry = self.registry();
        let fetcher = self.fetcher();
        match &self.pretrained_network {
            Some(name) => {
                info!(name = name.as_str(), "loading pretrained network");
                load_pretrained_network(name, &registry, &fetcher)
            }
            None => {
                info!(
                    architecture = self.network.architecture.as_str(),
                    pooling = self.network.pooling.as_str(),
                    "assembling network"
                );
                init_network(&self.network, &registry, &fetcher)
            }
        }
    }
}

impl Default for IrnetConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            name: None,
            pretrained_network: None,
            network: NetworkConfig::default(),
            extract: ExtractConfig::default(),
            data: DataConfig::default(),
            registry: None,
        }
    }
}

fn validate_network(network: &NetworkConfig) -> Result<(), ConfigLoadError> {
    if network.architecture.trim().is_empty() {
        return Err(ConfigLoadError::Validation(
            "network.architecture must not be empty".to_string(),
        ));
    }
    if network.pooling.parse::<PoolingKind>().is_err() {
        return Err(ConfigLoadError::Validation(format!(
            "network.pooling '{}' is not one of mac, spoc, gem, gemmp, rmac",
            network.pooling
        )));
    }
    if !(network.p.is_finite() && network.p > 0.0) {
        return Err(ConfigLoadError::Validation(
            "network.p must be positive".to_string(),
        ));
    }
    if network.std.iter().any(|s| *s <= 0.0) {
        return Err(ConfigLoadError::Validation(
            "network.std entries must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Where artifacts are cached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Cache root; artifacts land in `<root>/networks` and `<root>/whiten`
    #[serde(default = "default_data_root")]
    pub root: PathBuf,

    /// Never download, only use cached or local artifacts
    #[serde(default)]
    pub offline: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: default_data_root(),
            offline: false,
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}
