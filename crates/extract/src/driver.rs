//! Extraction drivers: lists of images, single images and whole folders.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array1, Array2};
use network::RetrievalNet;
use tracing::{debug, info, warn};

use crate::config::ExtractConfig;
use crate::dataset::{imresize, pil_loader, BoundingBox, ImageTransform, ImagesFromList};
use crate::loader::Loader;
use crate::multiscale::extract_scales;
use crate::ExtractError;

/// Describes every image in `images`, returning an `outputdim x N` matrix
/// whose column `i` belongs to `images[i]`.
///
/// The network runs in test mode for the duration of the call and gets its
/// previous mode back afterwards. The first image that fails to load aborts
/// the call.
pub fn extract_vectors(
    net: &mut RetrievalNet,
    images: &[PathBuf],
    transform: &ImageTransform,
    bbxs: Option<&[BoundingBox]>,
    config: &ExtractConfig,
) -> Result<Array2<f32>, ExtractError> {
    config.validate()?;
    let dataset = ImagesFromList::new(
        images.to_vec(),
        config.image_size,
        bbxs.map(<[BoundingBox]>::to_vec),
        *transform,
    )?;
    let net = net.eval_guard();
    let total = dataset.len();
    let mut vecs = Array2::<f32>::zeros((net.outputdim(), total));

    for (i, input) in Loader::new(Arc::new(dataset), config.num_workers).enumerate() {
        let input = input?;
        let v = extract_scales(&net, &input, &config.ms, config.msp)?;
        vecs.column_mut(i).assign(&v);

        let done = i + 1;
        if (config.print_freq > 0 && done % config.print_freq == 0) || done == total {
            info!(done, total, "extracting descriptors");
        }
    }
    Ok(vecs)
}

/// Describes a single image file. No crop is applied.
pub fn extract_vectors_single(
    net: &mut RetrievalNet,
    image: &Path,
    transform: &ImageTransform,
    config: &ExtractConfig,
) -> Result<Array1<f32>, ExtractError> {
    config.validate()?;
    let img = imresize(pil_loader(image)?, config.image_size);
    let input = transform.apply(&img);
    let net = net.eval_guard();
    extract_scales(&net, &input, &config.ms, config.msp)
}

/// Every `.jpg`/`.jpeg` file below `folder`, sorted, as absolute paths and
/// as paths relative to `root`.
pub fn collect_jpgs(folder: &Path, root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), ExtractError> {
    let mut found = Vec::new();
    walk(folder, &mut found)?;
    found.sort();
    let relative = found
        .iter()
        .map(|p| match p.strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => {
                warn!(path = %p.display(), root = %root.display(), "image outside root, keeping full path");
                p.clone()
            }
        })
        .collect();
    Ok((found, relative))
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ExtractError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(&path, out)?;
        } else if is_jpg(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_jpg(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
}

/// Describes every JPEG under `folder`. Returns the image paths relative to
/// `root` next to the `outputdim x N` descriptor matrix.
pub fn extract_folder(
    net: &mut RetrievalNet,
    folder: &Path,
    root: &Path,
    transform: &ImageTransform,
    config: &ExtractConfig,
) -> Result<(Vec<PathBuf>, Array2<f32>), ExtractError> {
    let (images, relative) = collect_jpgs(folder, root)?;
    debug!(folder = %folder.display(), count = images.len(), "collected images");
    if images.is_empty() {
        warn!(folder = %folder.display(), "no jpeg images found");
    }
    let vecs = extract_vectors(net, &images, transform, None, config)?;
    Ok((relative, vecs))
}
