//! Pretrained parameter artifacts: where they live and how they decode.
//!
//! [`ArtifactFetcher`] turns a registry URI into a local file (downloading
//! and caching as needed); [`read_state_dict`] turns that file, either a
//! safetensors container or a PyTorch checkpoint, into a
//! [`layers::StateDict`].

mod blob;
mod error;
mod fetch;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod torch;

use layers::StateDict;

pub use blob::{read_state_dict, write_state_dict};
pub use error::ArtifactError;
pub use fetch::{ArtifactFetcher, CachedFetcher};

/// Fetches `uri` into `subdir` of the cache and decodes it.
pub fn load_artifact(
    fetcher: &dyn ArtifactFetcher,
    uri: &str,
    subdir: &str,
) -> Result<StateDict, ArtifactError> {
    let path = fetcher.fetch(uri, subdir)?;
    read_state_dict(&path)
}
