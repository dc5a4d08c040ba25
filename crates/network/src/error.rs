use layers::LayerError;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced while assembling or running a retrieval network.
///
/// Everything except [`NetworkError::Layer`] is raised at assembly time; a
/// network that was built successfully only fails on malformed input.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No output-dimension entry or no feature-stripping rule for the name.
    #[error("unsupported or unknown architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("unsupported or unknown pooling: {0}")]
    UnsupportedPooling(String),
    #[error("unknown pretrained network: {0}")]
    UnknownPretrainedNetwork(String),
    /// A registered artifact exists but could not be used: fetch failure,
    /// corrupt blob, missing tensor or shape mismatch.
    #[error("failed to load artifact {artifact}: {source}")]
    ArtifactLoad {
        artifact: String,
        #[source]
        source: BoxError,
    },
    /// The backbone produces a different channel count than the registry
    /// promises for the architecture.
    #[error("{architecture} produces {actual} channels, registry says {expected}")]
    DimensionMismatch {
        architecture: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid network config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Layer(#[from] LayerError),
}

impl NetworkError {
    pub(crate) fn artifact(artifact: &str, source: impl Into<BoxError>) -> Self {
        NetworkError::ArtifactLoad {
            artifact: artifact.to_string(),
            source: source.into(),
        }
    }
}
