//! Image retrieval networks: a convolutional trunk, optional local
//! whitening, (regional) pooling, optional global whitening and L2
//! normalization, assembled from a [`NetworkConfig`] and a
//! [`registry::Registry`] of pretrained artifacts.

mod assemble;
mod config;
mod error;
mod meta;
mod model;

pub use assemble::{
    config_from_name, init_network, init_network_with, load_pretrained_network,
    load_pretrained_network_with,
};
pub use config::NetworkConfig;
pub use error::NetworkError;
pub use meta::NetworkMeta;
pub use model::{EvalGuard, RetrievalNet, Stage};
