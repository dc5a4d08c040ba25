//! Writers for PyTorch checkpoints of `f32` state dicts, so tests can
//! seed caches with artifacts in the published format.

use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

use layers::StateDict;
use ndarray::ArrayD;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::ArtifactError;

/// Minimal protocol-2 pickle emitter.
pub(crate) struct Pickle(Vec<u8>);

impl Pickle {
    pub(crate) fn new() -> Self {
        Self(vec![0x80, 2])
    }

    pub(crate) fn op(&mut self, op: u8) -> &mut Self {
        self.0.push(op);
        self
    }

    pub(crate) fn global(&mut self, module: &str, name: &str) -> &mut Self {
        self.0.push(b'c');
        self.0.extend_from_slice(module.as_bytes());
        self.0.push(b'\n');
        self.0.extend_from_slice(name.as_bytes());
        self.0.push(b'\n');
        self
    }

    pub(crate) fn string(&mut self, s: &str) -> &mut Self {
        self.0.push(b'X');
        self.0.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.0.extend_from_slice(s.as_bytes());
        self
    }

    pub(crate) fn int(&mut self, v: i32) -> &mut Self {
        self.0.push(b'J');
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub(crate) fn finish(&mut self) -> Vec<u8> {
        self.0.push(b'.');
        std::mem::take(&mut self.0)
    }
}

fn le_bytes(tensor: &ArrayD<f32>) -> Vec<u8> {
    tensor.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// `OrderedDict` of `_rebuild_tensor_v2` calls, storage `i` for entry `i`.
/// Legacy persistent ids carry an extra (empty) view field.
fn state_dict_pickle(dict: &StateDict, legacy: bool) -> Vec<u8> {
    let mut p = Pickle::new();
    p.global("collections", "OrderedDict").op(b')').op(b'R').op(b'(');
    for (i, (name, tensor)) in dict.iter().enumerate() {
        p.string(name)
            .global("torch._utils", "_rebuild_tensor_v2")
            .op(b'(');
        p.op(b'(')
            .string("storage")
            .global("torch", "FloatStorage")
            .string(&i.to_string())
            .string("cpu")
            .int(tensor.len() as i32);
        if legacy {
            p.op(b'N');
        }
        p.op(b't').op(b'Q').int(0);

        let shape = tensor.shape();
        p.op(b'(');
        for dim in shape {
            p.int(*dim as i32);
        }
        p.op(b't').op(b'(');
        for axis in 0..shape.len() {
            p.int(shape[axis + 1..].iter().product::<usize>() as i32);
        }
        p.op(b't');
        p.op(0x89)
            .global("collections", "OrderedDict")
            .op(b')')
            .op(b'R')
            .op(b't')
            .op(b'R');
    }
    p.op(b'u');
    p.finish()
}

/// A checkpoint in the zip layout `torch.save` has written since 1.6.
pub fn torch_checkpoint(dict: &StateDict) -> Result<Vec<u8>, ArtifactError> {
    let to_err = |e: zip::result::ZipError| ArtifactError::Decode {
        artifact: "archive".into(),
        reason: e.to_string(),
    };
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file("archive/data.pkl", options).map_err(to_err)?;
    zip.write_all(&state_dict_pickle(dict, false))?;
    for (i, (_, tensor)) in dict.iter().enumerate() {
        zip.start_file(format!("archive/data/{i}"), options)
            .map_err(to_err)?;
        zip.write_all(&le_bytes(tensor))?;
    }
    zip.start_file("archive/version", options).map_err(to_err)?;
    zip.write_all(b"3\n")?;
    Ok(zip.finish().map_err(to_err)?.into_inner())
}

/// A checkpoint in the single-stream layout of torch before 1.6.
pub fn legacy_torch_checkpoint(dict: &StateDict) -> Vec<u8> {
    let mut out = vec![0x80, 2, 0x8a, 10];
    out.extend_from_slice(&0x1950a86a20f9469cfc6c_u128.to_le_bytes()[..10]);
    out.push(b'.');
    // protocol version 1001
    out.extend_from_slice(&[0x80, 2, b'M', 0xe9, 0x03, b'.']);
    out.extend(
        Pickle::new()
            .op(b'}')
            .op(b'(')
            .string("little_endian")
            .op(0x88)
            .op(b'u')
            .finish(),
    );
    out.extend(state_dict_pickle(dict, true));

    let mut keys = Pickle::new();
    keys.op(b']').op(b'(');
    for i in 0..dict.len() {
        keys.string(&i.to_string());
    }
    keys.op(b'e');
    out.extend(keys.finish());

    for (_, tensor) in dict.iter() {
        out.extend_from_slice(&(tensor.len() as u64).to_le_bytes());
        out.extend(le_bytes(tensor));
    }
    out
}

/// Writes [`torch_checkpoint`] to `path`, creating parent directories.
pub fn write_torch_checkpoint(dict: &StateDict, path: &Path) -> Result<(), ArtifactError> {
    let bytes = torch_checkpoint(dict)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}
