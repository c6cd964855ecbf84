use std::path::PathBuf;

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{stack, Array3, Array4, ArrayView3, Axis};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One annotation's pixels as the model sees them.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInput {
    pub path: PathBuf,
    /// x, y, w, h in source pixels.
    pub bbox: [f32; 4],
    pub viewpoint: Option<String>,
}

/// Test-time transform: crop → optional mirror → resize → normalise.
#[derive(Debug, Clone, PartialEq)]
pub struct Preprocess {
    /// (height, width)
    pub image_size: (u32, u32),
    pub fliplr: bool,
    pub fliplr_view: Vec<String>,
}

impl Preprocess {
    pub fn load(&self, input: &ImageInput) -> Result<Array3<f32>> {
        let img = image::open(&input.path)
            .with_context(|| format!("opening {}", input.path.display()))?;
        self.apply(&img, input.bbox, input.viewpoint.as_deref())
    }

    pub fn apply(&self, img: &DynamicImage, bbox: [f32; 4], viewpoint: Option<&str>) -> Result<Array3<f32>> {
        let mut chip = crop_bbox(img, bbox)?;
        if self.should_flip(viewpoint) {
            chip = chip.fliph();
        }
        let (h, w) = self.image_size;
        let resized = chip.resize_exact(w, h, FilterType::Triangle);
        Ok(to_tensor(&resized))
    }

    fn should_flip(&self, viewpoint: Option<&str>) -> bool {
        self.fliplr && viewpoint.is_some_and(|v| self.fliplr_view.iter().any(|f| f == v))
    }
}

/// Crops to the bbox clamped to the image bounds.
pub fn crop_bbox(img: &DynamicImage, bbox: [f32; 4]) -> Result<DynamicImage> {
    let (width, height) = img.dimensions();
    let [x, y, w, h] = bbox;
    let x0 = x.max(0.0).floor().min(width as f32) as u32;
    let y0 = y.max(0.0).floor().min(height as f32) as u32;
    let x1 = (x + w).ceil().clamp(0.0, width as f32) as u32;
    let y1 = (y + h).ceil().clamp(0.0, height as f32) as u32;
    if x1 <= x0 || y1 <= y0 {
        anyhow::bail!("bbox {bbox:?} does not overlap the {width}x{height} image");
    }
    Ok(img.crop_imm(x0, y0, x1 - x0, y1 - y0))
}

/// RGB pixels to a normalised CHW tensor.
pub fn to_tensor(img: &DynamicImage) -> Array3<f32> {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    Array3::from_shape_fn((3, h as usize, w as usize), |(c, y, x)| {
        let v = rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
        (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
    })
}

/// Stacks equally sized CHW tensors into an NCHW batch.
pub fn stack_batch(items: &[Array3<f32>]) -> Result<Array4<f32>> {
    if items.is_empty() {
        anyhow::bail!("cannot stack an empty batch");
    }
    let views: Vec<ArrayView3<f32>> = items.iter().map(|a| a.view()).collect();
    Ok(stack(Axis(0), &views)?)
}
