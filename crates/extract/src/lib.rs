//! Descriptor extraction for image retrieval networks.
//!
//! Images are decoded and normalized by [`ImagesFromList`], prefetched by
//! [`Loader`] and pushed one at a time through a
//! [`network::RetrievalNet`], at one or several scales.

mod config;
mod dataset;
mod driver;
mod error;
mod features;
mod loader;
mod multiscale;

pub use config::ExtractConfig;
pub use dataset::{imresize, pil_loader, BoundingBox, ImageTransform, ImagesFromList};
pub use driver::{collect_jpgs, extract_folder, extract_vectors, extract_vectors_single};
pub use error::ExtractError;
pub use features::{save_path_feature, FeatureFile};
pub use loader::Loader;
pub use multiscale::{extract_ms, extract_ss};

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    use artifacts::CachedFetcher;
    use image::{Rgb, RgbImage};
    use ndarray::{Array, Array4};
    use network::{init_network, NetworkConfig, RetrievalNet};
    use registry::Registry;

    /// Untrained network in test mode.
    pub fn test_net(architecture: &str) -> RetrievalNet {
        let config = NetworkConfig {
            pretrained: false,
            ..NetworkConfig::for_architecture(architecture)
        };
        let fetcher = CachedFetcher::new(std::env::temp_dir()).offline(true);
        let mut net = init_network(&config, &Registry::default(), &fetcher).unwrap();
        net.eval();
        net
    }

    /// Untrained resnet18 with `adjust` applied to its configuration.
    pub fn test_net_with(adjust: impl FnOnce(&mut NetworkConfig)) -> RetrievalNet {
        let mut config = NetworkConfig {
            pretrained: false,
            ..NetworkConfig::for_architecture("resnet18")
        };
        adjust(&mut config);
        let fetcher = CachedFetcher::new(std::env::temp_dir()).offline(true);
        init_network(&config, &Registry::default(), &fetcher).unwrap()
    }

    pub fn image_tensor(h: usize, w: usize) -> Array4<f32> {
        Array::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
            ((c * 7 + y * 3 + x * 5) % 17) as f32 / 17.0 - 0.4
        })
    }

    pub fn write_jpg(dir: &Path, name: &str, w: u32, h: u32, seed: u8) -> PathBuf {
        let img = RgbImage::from_fn(w, h, |x, y| {
            Rgb([
                (x * 9 + seed as u32 * 31) as u8,
                (y * 13 + x * 3) as u8,
                (seed as u32 * 57 + y * 4) as u8,
            ])
        });
        let path = dir.join(name);
        img.save_with_format(&path, image::ImageFormat::Jpeg).unwrap();
        path
    }
}
