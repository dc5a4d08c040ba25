//! Building blocks of image retrieval networks: backbone trunks, global
//! pooling, whitening, normalization and named parameter state.
//!
//! All tensors are `ndarray` arrays of `f32`. Feature maps are
//! `(batch, channels, height, width)`; pooled descriptors are `(batch, dim)`.

mod attention;
mod backbone;
mod error;
mod linear;
mod normalize;
mod pooling;
mod state;
mod tensor;

pub use attention::{AttentionExtractor, SecondOrderAttention};
pub use backbone::{
    ArchitectureFamily, BackboneNet, BackboneProvider, BatchNorm, Conv, FeatureExtractor, Layer,
    ReferenceBackbones, Sequential,
};
pub use error::LayerError;
pub use linear::Linear;
pub use normalize::{l2_normalize_eps, l2_normalize_in_place, PowerLaw, L2N};
pub use pooling::{rmac_regions, Pooling, PoolingKind, Region, Rpool, RMAC_LEVELS};
pub use state::{join, to_dyn, StateDict, Stateful};
pub use tensor::{interpolate_bilinear, positions_to_rows, rows_to_positions, Mode};
