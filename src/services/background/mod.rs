// Background removal using a U²-Net style salient-object segmentation model

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, Luma, RgbaImage};
use ndarray::Array4;
use ort::value::Tensor;
use std::path::Path;
use tracing::{debug, info, instrument};

use crate::core::config::Config;
use crate::services::onnx_builder::{self, Backend, SessionPool};

/// ImageNet statistics the segmentation model was trained with
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Foreground segmentation service
pub struct BackgroundRemover {
    pool: SessionPool,
    input_size: u32,
}

impl BackgroundRemover {
    /// Load the segmentation model and build its session pool
    #[instrument(skip(config), fields(model = %config.background.model_path))]
    pub fn new(config: &Config) -> Result<Self> {
        let model_bytes =
            onnx_builder::load_model_bytes(Path::new(&config.background.model_path), "background")?;
        let pool = SessionPool::build(
            &model_bytes,
            "background",
            config.onnx_pool_size(),
            config.inference.backend.as_deref(),
        )?;

        let service = Self {
            pool,
            input_size: config.background.input_size,
        };

        info!("Running warmup inference for background removal...");
        let warmup_start = std::time::Instant::now();
        service.predict_mask(&DynamicImage::new_rgb8(8, 8))?;
        info!(
            "✓ Background warmup completed in {:.2}ms",
            warmup_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(service)
    }

    pub fn backend(&self) -> Backend {
        self.pool.backend()
    }

    /// Predict a foreground alpha mask at the image's own resolution
    #[instrument(skip(self, img), fields(width = img.width(), height = img.height()))]
    pub fn predict_mask(&self, img: &DynamicImage) -> Result<GrayImage> {
        let start = std::time::Instant::now();
        let input = Tensor::from_array(preprocess(img, self.input_size))?;

        let prediction = {
            let mut session = self.pool.acquire()?;
            let outputs = session.run(ort::inputs![input])?;
            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .context("Segmentation output is not an f32 tensor")?;
            debug!("Segmentation output shape: {:?}", shape);
            data.to_vec()
        };

        let mask = mask_from_prediction(&prediction, self.input_size, img.width(), img.height())?;
        debug!(
            "Background mask completed in {:.2}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(mask)
    }

    /// Cut the foreground out of `img`, leaving the background transparent
    pub fn remove_background(&self, img: &DynamicImage) -> Result<RgbaImage> {
        let mask = self.predict_mask(img)?;
        cut_out(img, &mask)
    }
}

/// Colour image with `mask` as its alpha channel
pub fn cut_out(img: &DynamicImage, mask: &GrayImage) -> Result<RgbaImage> {
    anyhow::ensure!(
        img.dimensions() == mask.dimensions(),
        "mask is {}x{}, image is {}x{}",
        mask.width(),
        mask.height(),
        img.width(),
        img.height()
    );
    let mut rgba = img.to_rgba8();
    for (pixel, alpha) in rgba.pixels_mut().zip(mask.pixels()) {
        pixel[3] = alpha[0];
    }
    Ok(rgba)
}

/// Resize to `size`x`size`, scale by the brightest channel value and normalize
/// with ImageNet statistics into an NCHW tensor.
pub fn preprocess(img: &DynamicImage, size: u32) -> Array4<f32> {
    let resized = img.resize_exact(size, size, FilterType::Lanczos3).to_rgb8();
    let max = resized
        .pixels()
        .flat_map(|p| p.0)
        .max()
        .map(|m| (m as f32).max(1e-6))
        .unwrap_or(1.0);

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 / max - MEAN[c]) / STD[c];
        }
    }
    tensor
}

/// Turn the model's first output channel into an 8-bit mask at the original size.
///
/// The prediction is min-max normalized before scaling to 0..=255.
pub fn mask_from_prediction(
    prediction: &[f32],
    size: u32,
    orig_width: u32,
    orig_height: u32,
) -> Result<GrayImage> {
    let side = size as usize;
    let plane = side
        .checked_mul(side)
        .context("segmentation input size overflows")?;
    anyhow::ensure!(
        prediction.len() >= plane,
        "segmentation output has {} values, expected at least {}",
        prediction.len(),
        plane
    );

    let channel = &prediction[..plane];
    let (min, max) = channel
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;

    let low_res = GrayImage::from_fn(size, size, |x, y| {
        let v = channel[y as usize * side + x as usize];
        let norm = if range > f32::EPSILON { (v - min) / range } else { 0.0 };
        Luma([(norm * 255.0).round().clamp(0.0, 255.0) as u8])
    });

    Ok(image::imageops::resize(
        &low_res,
        orig_width,
        orig_height,
        FilterType::Lanczos3,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(50, 30, Rgb([255, 255, 255])));
        let tensor = preprocess(&img, 32);
        assert_eq!(tensor.shape(), &[1, 3, 32, 32]);

        // White divides to 1.0 before normalization
        let expected = (1.0 - MEAN[0]) / STD[0];
        assert!((tensor[[0, 0, 5, 5]] - expected).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_black_image_is_finite() {
        let img = DynamicImage::new_rgb8(10, 10);
        let tensor = preprocess(&img, 16);
        assert!(tensor.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_mask_is_min_max_normalized() {
        // Left half background, right half foreground
        let size = 4;
        let prediction: Vec<f32> = (0..16)
            .map(|i| if i % 4 >= 2 { 0.9 } else { 0.1 })
            .collect();
        let mask = mask_from_prediction(&prediction, size, 4, 4).unwrap();
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert_eq!(mask.get_pixel(3, 3)[0], 255);
    }

    #[test]
    fn test_mask_resizes_to_original() {
        let prediction = vec![0.5; 16];
        let mask = mask_from_prediction(&prediction, 4, 30, 12).unwrap();
        assert_eq!(mask.dimensions(), (30, 12));
        // Flat prediction carries no foreground signal
        assert!(mask.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_cut_out_keeps_colour_and_uses_mask_as_alpha() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, Rgb([200, 40, 10])));
        let mask = GrayImage::from_fn(4, 2, |x, _| if x < 2 { Luma([0]) } else { Luma([255]) });

        let rgba = cut_out(&img, &mask).unwrap();
        assert_eq!(rgba.get_pixel(0, 0).0, [200, 40, 10, 0]);
        assert_eq!(rgba.get_pixel(3, 1).0, [200, 40, 10, 255]);

        assert!(cut_out(&img, &GrayImage::new(2, 2)).is_err());
    }

    #[test]
    fn test_mask_rejects_huge_input_size() {
        assert!(mask_from_prediction(&[0.0; 4], u32::MAX, 4, 4).is_err());
    }

    #[test]
    fn test_mask_rejects_short_output() {
        assert!(mask_from_prediction(&[0.0; 3], 4, 4, 4).is_err());
    }
}
