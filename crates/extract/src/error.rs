use std::path::PathBuf;

use layers::LayerError;
use network::NetworkError;
use thiserror::Error;

/// Errors raised while loading images or extracting descriptors. Any of them
/// aborts the whole extraction call.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Reading, decoding, cropping or resizing an image failed.
    #[error("failed to load image {}: {reason}", path.display())]
    ImageLoad { path: PathBuf, reason: String },
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    /// Inputs whose sizes do not line up, e.g. fewer boxes than images.
    #[error("shape error: {0}")]
    Shape(String),
    #[error("invalid extraction config: {0}")]
    InvalidConfig(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("feature file error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExtractError {
    pub(crate) fn image(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ExtractError::ImageLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_load_names_the_file() {
        let err = ExtractError::image("/data/a.jpg", "unexpected end of file");
        assert_eq!(
            err.to_string(),
            "failed to load image /data/a.jpg: unexpected end of file"
        );
    }

    #[test]
    fn network_errors_pass_through() {
        let err: ExtractError = NetworkError::UnsupportedPooling("avg".into()).into();
        assert_eq!(err.to_string(), "unsupported or unknown pooling: avg");
    }
}
