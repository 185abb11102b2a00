// Phase 2: Random Augmentation Pipeline

use image::imageops::FilterType;
use image::{ImageBuffer, Luma, LumaA, Pixel};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::config::Config;
use crate::core::types::AugmentationRecord;
use crate::phases::WorkingImage;
use crate::utils::image_ops::crop_or_pad;

/// Blur radii below this leave the image untouched
const MIN_BLUR_RADIUS: f32 = 0.1;

/// Phase 2 pipeline: rotate, scale, blur, each with its own coin flip
pub struct AugmentPipeline {
    config: Arc<Config>,
}

impl AugmentPipeline {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Per-file generator. A job seed makes the whole batch reproducible.
    pub fn rng_for(seed: Option<u64>, index: usize) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ index as u64),
            None => StdRng::from_entropy(),
        }
    }

    /// Decide which transforms to apply and with what parameters.
    ///
    /// Draw order is fixed (rotate, scale, blur) so seeded runs repeat exactly.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> AugmentationRecord {
        let cfg = &self.config.augment;
        let mut record = AugmentationRecord::default();

        if rng.gen::<f32>() < cfg.probability {
            record.rotation_degrees = Some(draw_below(rng, cfg.rotation_max_degrees));
        }
        if rng.gen::<f32>() < cfg.probability {
            record.scale_factor = Some(rng.gen_range(cfg.scale_min..=cfg.scale_max));
        }
        if rng.gen::<f32>() < cfg.probability {
            record.blur_radius = Some(draw_below(rng, cfg.blur_max_radius));
        }
        record
    }

    #[instrument(skip(self, img, rng), fields(filename = %filename))]
    pub fn execute<R: Rng>(
        &self,
        img: WorkingImage,
        filename: &str,
        rng: &mut R,
    ) -> (WorkingImage, AugmentationRecord) {
        let record = self.sample(rng);
        debug!("Augmentation for {}: {:?}", filename, record);
        (apply(img, &record), record)
    }
}

fn draw_below<R: Rng>(rng: &mut R, max: f32) -> f32 {
    if max > 0.0 {
        rng.gen_range(0.0..max)
    } else {
        0.0
    }
}

/// Apply a previously sampled record. Dimensions never change.
pub fn apply(img: WorkingImage, record: &AugmentationRecord) -> WorkingImage {
    match img {
        WorkingImage::Gray(buf) => WorkingImage::Gray(transform(buf, record, Luma([0]))),
        WorkingImage::GrayAlpha(buf) => {
            WorkingImage::GrayAlpha(transform(buf, record, LumaA([0, 0])))
        }
    }
}

fn transform<P>(
    mut img: ImageBuffer<P, Vec<u8>>,
    record: &AugmentationRecord,
    fill: P,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + Send + Sync + 'static,
{
    if let Some(degrees) = record.rotation_degrees {
        img = rotate_ccw(&img, degrees, fill);
    }
    if let Some(factor) = record.scale_factor {
        img = scale_about_center(&img, factor, fill);
    }
    if let Some(radius) = record.blur_radius {
        if radius >= MIN_BLUR_RADIUS {
            img = image::imageops::blur(&img, radius);
        }
    }
    img
}

/// Counter-clockwise rotation on a fixed canvas
pub fn rotate_ccw<P>(img: &ImageBuffer<P, Vec<u8>>, degrees: f32, fill: P) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + Send + Sync + 'static,
{
    // rotate_about_center turns clockwise for positive angles
    rotate_about_center(img, -degrees.to_radians(), Interpolation::Bilinear, fill)
}

/// Zoom about the centre, then crop or pad back to the original size
pub fn scale_about_center<P>(
    img: &ImageBuffer<P, Vec<u8>>,
    factor: f32,
    fill: P,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let (width, height) = img.dimensions();
    let scaled_w = ((width as f32 * factor).round() as u32).max(1);
    let scaled_h = ((height as f32 * factor).round() as u32).max(1);
    if (scaled_w, scaled_h) == (width, height) {
        return img.clone();
    }

    let scaled = image::imageops::resize(img, scaled_w, scaled_h, FilterType::Lanczos3);
    let x = (scaled_w as i64 - width as i64) / 2;
    let y = (scaled_h as i64 - height as i64) / 2;
    crop_or_pad(&scaled, x, y, width, height, fill)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayAlphaImage, GrayImage};

    fn pipeline(probability: f32) -> AugmentPipeline {
        let mut config = Config::default();
        config.augment.probability = probability;
        AugmentPipeline::new(Arc::new(config))
    }

    fn half_white(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| {
            if x < width / 2 { Luma([255]) } else { Luma([0]) }
        })
    }

    #[test]
    fn test_zero_probability_is_identity() {
        let img = half_white(40, 60);
        let mut rng = AugmentPipeline::rng_for(Some(7), 0);
        let (out, record) = pipeline(0.0).execute(WorkingImage::Gray(img.clone()), "a.jpg", &mut rng);

        assert!(record.is_identity());
        match out {
            WorkingImage::Gray(out) => assert_eq!(out, img),
            WorkingImage::GrayAlpha(_) => panic!("alpha appeared"),
        }
    }

    #[test]
    fn test_full_probability_applies_everything() {
        let mut rng = AugmentPipeline::rng_for(Some(11), 3);
        let record = pipeline(1.0).sample(&mut rng);

        let degrees = record.rotation_degrees.unwrap();
        let factor = record.scale_factor.unwrap();
        let radius = record.blur_radius.unwrap();
        assert!((0.0..360.0).contains(&degrees));
        assert!((0.8..=1.2).contains(&factor));
        assert!((0.0..5.0).contains(&radius));
    }

    #[test]
    fn test_seeded_runs_repeat() {
        let p = pipeline(0.5);
        let img = half_white(30, 50);

        let mut rng_a = AugmentPipeline::rng_for(Some(42), 5);
        let mut rng_b = AugmentPipeline::rng_for(Some(42), 5);
        let (a, rec_a) = p.execute(WorkingImage::Gray(img.clone()), "a", &mut rng_a);
        let (b, rec_b) = p.execute(WorkingImage::Gray(img), "a", &mut rng_b);

        assert_eq!(rec_a, rec_b);
        match (a, b) {
            (WorkingImage::Gray(a), WorkingImage::Gray(b)) => assert_eq!(a, b),
            _ => panic!("unexpected variant"),
        }
    }

    #[test]
    fn test_different_files_get_different_streams() {
        let p = pipeline(1.0);
        let a = p.sample(&mut AugmentPipeline::rng_for(Some(42), 0));
        let b = p.sample(&mut AugmentPipeline::rng_for(Some(42), 1));
        assert_ne!(a, b);
    }

    #[test]
    fn test_dimensions_preserved() {
        let record = AugmentationRecord {
            rotation_degrees: Some(33.0),
            scale_factor: Some(1.17),
            blur_radius: Some(2.0),
        };
        let out = apply(WorkingImage::Gray(half_white(45, 80)), &record);
        assert_eq!(out.dimensions(), (45, 80));

        let alpha = GrayAlphaImage::from_pixel(45, 80, LumaA([100, 255]));
        let out = apply(WorkingImage::GrayAlpha(alpha), &record);
        assert!(out.has_alpha());
        assert_eq!(out.dimensions(), (45, 80));
    }

    #[test]
    fn test_half_turn_swaps_sides() {
        let img = half_white(40, 40);
        let out = rotate_ccw(&img, 180.0, Luma([0]));
        assert!(out.get_pixel(3, 20)[0] < 50);
        assert!(out.get_pixel(36, 20)[0] > 200);
    }

    #[test]
    fn test_quarter_turn_is_counter_clockwise() {
        // Bright patch right of centre
        let mut img = GrayImage::from_pixel(40, 40, Luma([0]));
        for y in 16..24 {
            for x in 28..36 {
                img.put_pixel(x, y, Luma([255]));
            }
        }

        let out = rotate_ccw(&img, 90.0, Luma([0]));
        // Right of centre moves above centre, not below
        assert!(out.get_pixel(20, 8)[0] > 200);
        assert!(out.get_pixel(20, 32)[0] < 50);
        assert!(out.get_pixel(32, 20)[0] < 50);
    }

    #[test]
    fn test_rotation_fills_transparent_corners() {
        let img = GrayAlphaImage::from_pixel(40, 40, LumaA([200, 255]));
        let out = rotate_ccw(&img, 45.0, LumaA([0, 0]));
        assert_eq!(out.get_pixel(0, 0)[1], 0);
        assert_eq!(out.get_pixel(20, 20)[1], 255);
    }

    #[test]
    fn test_zoom_out_pads_with_fill() {
        let img = GrayImage::from_pixel(40, 40, Luma([255]));
        let out = scale_about_center(&img, 0.5, Luma([0]));
        assert_eq!(out.dimensions(), (40, 40));
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(20, 20)[0], 255);
    }

    #[test]
    fn test_zoom_in_keeps_centre() {
        let mut img = GrayImage::from_pixel(40, 40, Luma([0]));
        for y in 10..30 {
            for x in 10..30 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        let out = scale_about_center(&img, 2.0, Luma([0]));
        // The bright square now covers the whole canvas
        assert!(out.get_pixel(5, 5)[0] > 200);
        assert!(out.get_pixel(34, 34)[0] > 200);
    }

    #[test]
    fn test_tiny_blur_is_noop() {
        let img = half_white(20, 20);
        let record = AugmentationRecord {
            rotation_degrees: None,
            scale_factor: None,
            blur_radius: Some(0.05),
        };
        match apply(WorkingImage::Gray(img.clone()), &record) {
            WorkingImage::Gray(out) => assert_eq!(out, img),
            WorkingImage::GrayAlpha(_) => panic!("alpha appeared"),
        }
    }
}
