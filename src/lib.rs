//! Workspace umbrella crate for irnet image retrieval networks.
//!
//! The member crates do the work:
//!
//! * [`registry`]: architecture dimensions and pretrained artifact locations
//! * [`layers`]: tensors, pooling, whitening, backbones and attention
//! * [`artifacts`]: fetching, caching and decoding parameter blobs
//! * [`network`]: assembling and running retrieval networks
//! * [`extract`]: image loading and single/multi-scale extraction
//!
//! This crate re-exports their public API and adds the YAML run
//! configuration and one error type covering all of them.

pub mod config;

pub use artifacts::{
    ArtifactError, ArtifactFetcher, CachedFetcher, load_artifact, read_state_dict,
    write_state_dict,
};
pub use extract::{
    BoundingBox, ExtractConfig, ExtractError, FeatureFile, ImageTransform, ImagesFromList, Loader,
    collect_jpgs, extract_folder, extract_ms, extract_ss, extract_vectors,
    extract_vectors_single, imresize, pil_loader, save_path_feature,
};
pub use layers::{LayerError, Mode, Pooling, PoolingKind, StateDict, Stateful, to_dyn};
pub use network::{
    EvalGuard, NetworkConfig, NetworkError, NetworkMeta, RetrievalNet, Stage, config_from_name,
    init_network, init_network_with, load_pretrained_network, load_pretrained_network_with,
};
pub use registry::{NETWORKS_DIR, Registry, RegistryError, RegistryOverrides, WHITEN_DIR};

pub use config::{ConfigLoadError, DataConfig, IrnetConfig};

use thiserror::Error;

/// Any failure surfaced by the irnet crates.
#[derive(Debug, Error)]
pub enum IrnetError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigLoadError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),
}
