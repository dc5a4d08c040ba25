use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ExtractError;

/// Descriptors of a named image collection together with the path of every
/// image, as written by [`save_path_feature`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFile {
    pub name: String,
    pub dim: usize,
    pub paths: Vec<String>,
    /// One descriptor per image, in `paths` order.
    pub vectors: Vec<Vec<f32>>,
}

impl FeatureFile {
    /// Builds a feature file from an `outputdim x N` matrix.
    pub fn from_columns(
        name: impl Into<String>,
        vecs: ArrayView2<'_, f32>,
        paths: &[PathBuf],
    ) -> Result<Self, ExtractError> {
        let (dim, count) = vecs.dim();
        if count != paths.len() {
            return Err(ExtractError::Shape(format!(
                "{count} descriptors for {} paths",
                paths.len()
            )));
        }
        Ok(Self {
            name: name.into(),
            dim,
            paths: paths.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
            vectors: vecs.columns().into_iter().map(|c| c.to_vec()).collect(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let file: FeatureFile = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        if file.vectors.len() != file.paths.len() {
            return Err(ExtractError::Shape(format!(
                "{} vectors for {} paths in {}",
                file.vectors.len(),
                file.paths.len(),
                path.display()
            )));
        }
        if let Some(bad) = file.vectors.iter().find(|v| v.len() != file.dim) {
            return Err(ExtractError::Shape(format!(
                "vector of length {} in a {}-dimensional feature file",
                bad.len(),
                file.dim
            )));
        }
        Ok(file)
    }

    /// Descriptors as an `dim x N` matrix.
    pub fn matrix(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.dim, self.vectors.len()), |(d, n)| self.vectors[n][d])
    }

    /// `<out_dir>/<name>.features.json`
    pub fn file_path(out_dir: &Path, name: &str) -> PathBuf {
        out_dir.join(format!("{name}.features.json"))
    }
}

/// Writes the descriptors of `name` with their image paths under `out_dir`
/// and returns the file written.
pub fn save_path_feature(
    name: &str,
    out_dir: &Path,
    vecs: ArrayView2<'_, f32>,
    rel_paths: &[PathBuf],
) -> Result<PathBuf, ExtractError> {
    let file = FeatureFile::from_columns(name, vecs, rel_paths)?;
    fs::create_dir_all(out_dir)?;
    let path = FeatureFile::file_path(out_dir, name);
    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer(&mut writer, &file)?;
    writer.flush()?;
    info!(name, count = file.paths.len(), path = %path.display(), "saved descriptors");
    Ok(path)
}
