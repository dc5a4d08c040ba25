use thiserror::Error;

/// Errors surfaced by layer construction, parameter loading and forward passes.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A parameter exists but its shape does not match the layer. Shapes are
    /// never truncated or padded to fit.
    #[error("shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("missing parameter: {0}")]
    MissingParameter(String),
    #[error("unexpected parameter: {0}")]
    UnexpectedParameter(String),
    /// The input channel count does not match what the layer was built for.
    #[error("{layer} expects {expected} input channels, got {actual}")]
    ChannelMismatch {
        layer: String,
        expected: usize,
        actual: usize,
    },
    #[error("input of {height}x{width} is too small for {layer}")]
    InputTooSmall {
        layer: String,
        height: usize,
        width: usize,
    },
    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),
    #[error("unknown pooling: {0}")]
    UnknownPooling(String),
    #[error("invalid attention layers '{0}' (expected digits 2-5)")]
    InvalidAttentionLayers(String),
    #[error("invalid scale factor: {0}")]
    InvalidScale(f32),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_names_parameter() {
        let err = LayerError::ShapeMismatch {
            name: "whiten.weight".into(),
            expected: vec![2048, 2048],
            actual: vec![512, 512],
        };
        let msg = err.to_string();
        assert!(msg.contains("whiten.weight"));
        assert!(msg.contains("[2048, 2048]"));
        assert!(msg.contains("[512, 512]"));
    }

    #[test]
    fn input_too_small_formatting() {
        let err = LayerError::InputTooSmall {
            layer: "maxpool".into(),
            height: 1,
            width: 3,
        };
        assert_eq!(err.to_string(), "input of 1x3 is too small for maxpool");
    }
}
