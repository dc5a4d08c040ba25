use std::io;
use thiserror::Error;

/// Errors raised while fetching or decoding a parameter blob.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The artifact could not be retrieved (network failure, bad status,
    /// missing local file, or a remote fetch while offline).
    #[error("failed to fetch {uri}: {reason}")]
    Fetch { uri: String, reason: String },
    /// Low-level IO failures while touching the cache.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The blob exists but is neither a readable safetensors container nor a
    /// readable PyTorch checkpoint, which usually means a truncated or
    /// corrupt download.
    #[error("corrupt artifact {artifact}: {reason}")]
    Decode { artifact: String, reason: String },
    #[error("tensor '{name}' has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },
}
