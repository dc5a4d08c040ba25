//! Image loading: decode to RGB, optional crop, shrink-only resize and
//! normalization into a `1 x 3 x H x W` tensor.

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use network::NetworkMeta;
use serde::{Deserialize, Serialize};

use crate::ExtractError;

/// Crop rectangle in pixel coordinates, `x0,y0` inclusive and `x1,y1`
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Pixel rectangle `(x, y, width, height)` clipped to a `width x height`
    /// image, or `None` when nothing is left.
    fn clip(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        let (x0, x1) = (clamp(self.x0, width), clamp(self.x1, width));
        let (y0, y1) = (clamp(self.y0, height), clamp(self.y1, height));
        (x1 > x0 && y1 > y0).then(|| (x0, y0, x1 - x0, y1 - y0))
    }
}

/// Opens `path` and converts it to 8-bit RGB whatever the stored layout.
pub fn pil_loader(path: &Path) -> Result<RgbImage, ExtractError> {
    let img = image::open(path).map_err(|err| ExtractError::image(path, err))?;
    Ok(img.to_rgb8())
}

/// Fits the longer side into `imsize`, keeping the aspect ratio. Images that
/// already fit are returned untouched.
pub fn imresize(img: RgbImage, imsize: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let longest = w.max(h);
    if longest <= imsize || imsize == 0 {
        return img;
    }
    let scale = imsize as f64 / longest as f64;
    let nw = ((w as f64 * scale).round() as u32).max(1);
    let nh = ((h as f64 * scale).round() as u32).max(1);
    imageops::resize(&img, nw, nh, FilterType::Lanczos3)
}

/// Converts RGB pixels to `(v / 255 - mean) / std`, channel-first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageTransform {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self {
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

impl ImageTransform {
    /// The normalization a network was assembled with.
    pub fn from_meta(meta: &NetworkMeta) -> Self {
        Self {
            mean: meta.mean,
            std: meta.std,
        }
    }

    pub fn apply(&self, img: &RgbImage) -> Array4<f32> {
        let (w, h) = img.dimensions();
        Array4::from_shape_fn((1, 3, h as usize, w as usize), |(_, c, y, x)| {
            let v = img.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
            (v - self.mean[c]) / self.std[c]
        })
    }
}

/// A list of image files turned into network inputs on demand.
#[derive(Debug, Clone)]
pub struct ImagesFromList {
    images: Vec<PathBuf>,
    imsize: u32,
    bbxs: Option<Vec<BoundingBox>>,
    transform: ImageTransform,
}

impl ImagesFromList {
    /// `bbxs`, when given, must hold one box per image.
    pub fn new(
        images: Vec<PathBuf>,
        imsize: u32,
        bbxs: Option<Vec<BoundingBox>>,
        transform: ImageTransform,
    ) -> Result<Self, ExtractError> {
        if let Some(boxes) = &bbxs {
            if boxes.len() != images.len() {
                return Err(ExtractError::Shape(format!(
                    "{} bounding boxes for {} images",
                    boxes.len(),
                    images.len()
                )));
            }
        }
        Ok(Self {
            images,
            imsize,
            bbxs,
            transform,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn path(&self, index: usize) -> Option<&Path> {
        self.images.get(index).map(PathBuf::as_path)
    }

    /// Loads image `index`: decode, crop to its box, resize, normalize.
    pub fn get(&self, index: usize) -> Result<Array4<f32>, ExtractError> {
        let path = self.path(index).ok_or_else(|| {
            ExtractError::Shape(format!("image index {index} out of range ({})", self.len()))
        })?;
        let mut img = pil_loader(path)?;
        if let Some(bbx) = self.bbxs.as_ref().map(|boxes| boxes[index]) {
            let (x, y, w, h) = bbx
                .clip(img.width(), img.height())
                .ok_or_else(|| ExtractError::image(path, format!("empty crop {bbx:?}")))?;
            img = imageops::crop_imm(&img, x, y, w, h).to_image();
        }
        let img = imresize(img, self.imsize);
        Ok(self.transform.apply(&img))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let img = RgbImage::from_fn(w, h, |x, y| Rgb([(x * 7) as u8, (y * 5) as u8, 128]));
        let path = dir.join(name);
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn imresize_only_shrinks() {
        let small = RgbImage::new(40, 20);
        assert_eq!(imresize(small, 64).dimensions(), (40, 20));

        let large = RgbImage::new(200, 100);
        assert_eq!(imresize(large, 64).dimensions(), (64, 32));

        let tall = RgbImage::new(30, 90);
        assert_eq!(imresize(tall, 45).dimensions(), (15, 45));
    }

    #[test]
    fn transform_normalizes_channel_first() {
        let img = RgbImage::from_pixel(2, 1, Rgb([255, 0, 51]));
        let t = ImageTransform {
            mean: [0.5, 0.0, 0.0],
            std: [0.5, 1.0, 0.2],
        };
        let x = t.apply(&img);
        assert_eq!(x.dim(), (1, 3, 1, 2));
        assert!((x[(0, 0, 0, 1)] - 1.0).abs() < 1e-6);
        assert_eq!(x[(0, 1, 0, 0)], 0.0);
        assert!((x[(0, 2, 0, 0)] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn loads_crops_and_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", 120, 60);
        let b = write_png(dir.path(), "b.png", 30, 30);

        let list = ImagesFromList::new(vec![a.clone(), b.clone()], 48, None, ImageTransform::default())
            .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0).unwrap().dim(), (1, 3, 24, 48));
        assert_eq!(list.get(1).unwrap().dim(), (1, 3, 30, 30));

        let boxes = vec![
            BoundingBox::new(10.0, 5.0, 50.0, 25.0),
            BoundingBox::new(-5.0, 0.0, 500.0, 10.0),
        ];
        let cropped = ImagesFromList::new(vec![a, b], 1000, Some(boxes), ImageTransform::default())
            .unwrap();
        assert_eq!(cropped.get(0).unwrap().dim(), (1, 3, 20, 40));
        assert_eq!(cropped.get(1).unwrap().dim(), (1, 3, 10, 30));
    }

    #[test]
    fn box_count_must_match() {
        let err = ImagesFromList::new(
            vec![PathBuf::from("a.jpg")],
            10,
            Some(Vec::new()),
            ImageTransform::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExtractError::Shape(_)));
    }

    #[test]
    fn unreadable_image_is_image_load() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.jpg");
        std::fs::write(&bogus, b"not a jpeg").unwrap();
        let list = ImagesFromList::new(
            vec![bogus.clone(), dir.path().join("missing.png")],
            64,
            None,
            ImageTransform::default(),
        )
        .unwrap();
        for i in 0..2 {
            match list.get(i) {
                Err(ExtractError::ImageLoad { path, .. }) => assert_eq!(Some(path.as_path()), list.path(i)),
                other => panic!("unexpected result {other:?}"),
            }
        }
    }

    #[test]
    fn empty_crop_is_image_load() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", 20, 20);
        let list = ImagesFromList::new(
            vec![a],
            64,
            Some(vec![BoundingBox::new(30.0, 30.0, 40.0, 40.0)]),
            ImageTransform::default(),
        )
        .unwrap();
        assert!(matches!(list.get(0), Err(ExtractError::ImageLoad { .. })));
    }
}
