//! Parameter blobs <-> [`StateDict`]. Reading accepts safetensors and
//! PyTorch checkpoints; writing produces safetensors.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use layers::StateDict;
use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::debug;

use crate::{torch, ArtifactError};

/// Reads every tensor of a safetensors file or a `torch.save` checkpoint,
/// told apart by their leading bytes. `f32` is taken as-is, `f64` is
/// narrowed; batch-norm step counters are skipped and any other dtype is
/// rejected.
pub fn read_state_dict(path: &Path) -> Result<StateDict, ArtifactError> {
    let bytes = fs::read(path)?;
    let artifact = path.display().to_string();
    if torch::is_torch_checkpoint(&bytes) {
        return torch::read_checkpoint(&bytes, &artifact);
    }
    let tensors = SafeTensors::deserialize(&bytes).map_err(|e| ArtifactError::Decode {
        artifact: artifact.clone(),
        reason: e.to_string(),
    })?;

    let mut dict = StateDict::new();
    for (name, view) in tensors.tensors() {
        let values: Vec<f32> = match view.dtype() {
            Dtype::F32 => view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            Dtype::F64 => view
                .data()
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
                .collect(),
            _ if name.ends_with("num_batches_tracked") => {
                debug!(tensor = %name, "skipping step counter");
                continue;
            }
            other => {
                return Err(ArtifactError::UnsupportedDtype {
                    name,
                    dtype: format!("{other:?}"),
                })
            }
        };
        let tensor = ArrayD::from_shape_vec(IxDyn(view.shape()), values).map_err(|e| {
            ArtifactError::Decode {
                artifact: artifact.clone(),
                reason: format!("tensor '{name}': {e}"),
            }
        })?;
        dict.insert(name, tensor);
    }
    debug!(path = %artifact, tensors = dict.len(), "decoded state dict");
    Ok(dict)
}

/// Writes `dict` as little-endian `f32` tensors.
pub fn write_state_dict(dict: &StateDict, path: &Path) -> Result<(), ArtifactError> {
    let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = dict
        .iter()
        .map(|(name, tensor)| {
            let bytes = tensor.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.to_string(), tensor.shape().to_vec(), bytes)
        })
        .collect();

    let mut views: HashMap<String, TensorView<'_>> = HashMap::new();
    for (name, shape, bytes) in &buffers {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes).map_err(|e| {
            ArtifactError::Decode {
                artifact: name.clone(),
                reason: e.to_string(),
            }
        })?;
        views.insert(name.clone(), view);
    }

    let encoded = safetensors::serialize(&views, &None).map_err(|e| ArtifactError::Decode {
        artifact: path.display().to_string(),
        reason: e.to_string(),
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, encoded)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use layers::to_dyn;

    #[test]
    fn state_dict_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/lw.safetensors");

        let mut dict = StateDict::new();
        dict.insert("weight", to_dyn(&[1.0, -2.0, 3.5, 0.25], &[2, 2]));
        dict.insert("bias", to_dyn(&[0.5, -0.5], &[2]));
        write_state_dict(&dict, &path).unwrap();

        let loaded = read_state_dict(&path).unwrap();
        assert_eq!(loaded, dict);
    }

    #[test]
    fn truncated_blob_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let mut dict = StateDict::new();
        dict.insert("weight", to_dyn(&[1.0; 16], &[4, 4]));
        write_state_dict(&dict, &path).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        let err = read_state_dict(&path).unwrap_err();
        assert!(matches!(err, ArtifactError::Decode { .. }));
        assert!(err.to_string().contains("w.safetensors"));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.pth");
        fs::write(&path, b"PK\x03\x04 not a safetensors file").unwrap();
        assert!(matches!(
            read_state_dict(&path),
            Err(ArtifactError::Decode { .. })
        ));
    }

    #[test]
    fn torch_checkpoints_are_recognized() {
        let dir = tempfile::tempdir().unwrap();
        let mut dict = StateDict::new();
        dict.insert("weight", to_dyn(&[1.0, 0.0, 0.0, 1.0], &[2, 2]));
        dict.insert("bias", to_dyn(&[0.0, 0.25], &[2]));

        let path = dir.path().join("whiten/w-454ad53.pth");
        crate::testing::write_torch_checkpoint(&dict, &path).unwrap();
        assert_eq!(read_state_dict(&path).unwrap(), dict);

        let legacy = dir.path().join("old.pth");
        fs::write(&legacy, crate::testing::legacy_torch_checkpoint(&dict)).unwrap();
        assert_eq!(read_state_dict(&legacy).unwrap(), dict);
    }

    #[test]
    fn integer_tensors_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ints.safetensors");
        let data: Vec<u8> = [1i32, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        let counter: Vec<u8> = 7i64.to_le_bytes().to_vec();
        let mut views = HashMap::new();
        views.insert(
            "bn1.num_batches_tracked".to_string(),
            TensorView::new(Dtype::I64, vec![], &counter).unwrap(),
        );
        fs::write(&path, safetensors::serialize(&views, &None).unwrap()).unwrap();
        assert!(read_state_dict(&path).unwrap().is_empty());

        views.insert(
            "labels".to_string(),
            TensorView::new(Dtype::I32, vec![3], &data).unwrap(),
        );
        fs::write(&path, safetensors::serialize(&views, &None).unwrap()).unwrap();
        assert!(matches!(
            read_state_dict(&path),
            Err(ArtifactError::UnsupportedDtype { .. })
        ));
    }
}
