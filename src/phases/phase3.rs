// Phase 3: Resize & Persist Pipeline

use image::{DynamicImage, ImageFormat, RgbaImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::config::Config;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::phases::WorkingImage;
use crate::utils::archive::secure_filename;
use crate::utils::image_ops::{processed_name, resize_exact, save_image};

/// Phase 3 pipeline: exact resize to the target geometry, then write to disk
pub struct PersistPipeline {
    config: Arc<Config>,
}

impl PersistPipeline {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Name of the processed file for an input name
    pub fn output_name(filename: &str, has_alpha: bool) -> String {
        processed_name(&secure_filename(filename), has_alpha)
    }

    /// Name of a colour cutout: the sanitized stem as `.png`
    pub fn cutout_name(filename: &str) -> String {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename);
        secure_filename(&format!("{}.png", stem))
    }

    /// Write a cutout at its own resolution
    pub fn save_cutout(
        &self,
        img: RgbaImage,
        output_name: &str,
        out_dir: &Path,
    ) -> PipelineResult<PathBuf> {
        let path = out_dir.join(output_name);
        DynamicImage::ImageRgba8(img)
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|e| PipelineError::PersistFailed {
                path: path.display().to_string(),
                source: e,
            })?;
        debug!("Saved cutout {}", path.display());
        Ok(path)
    }

    /// Resize without keeping aspect ratio
    pub fn resize(&self, img: WorkingImage) -> WorkingImage {
        let (w, h) = (
            self.config.output.target_width,
            self.config.output.target_height,
        );
        match img {
            WorkingImage::Gray(buf) => WorkingImage::Gray(resize_exact(&buf, w, h)),
            WorkingImage::GrayAlpha(buf) => WorkingImage::GrayAlpha(resize_exact(&buf, w, h)),
        }
    }

    #[instrument(skip(self, img, out_dir), fields(output = %output_name))]
    pub fn execute(
        &self,
        img: WorkingImage,
        output_name: &str,
        out_dir: &Path,
    ) -> PipelineResult<PathBuf> {
        let resized = self.resize(img);
        let path = out_dir.join(output_name);

        save_image(&resized.into_dynamic(), &path).map_err(|e| PipelineError::PersistFailed {
            path: path.display().to_string(),
            source: e,
        })?;

        debug!("Saved {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayAlphaImage, GrayImage, Luma, LumaA, Rgba};

    #[test]
    fn test_output_name_is_sanitized() {
        assert_eq!(
            PersistPipeline::output_name("my tower.jpg", false),
            "processed_my_tower.jpg"
        );
        assert_eq!(
            PersistPipeline::output_name("my tower.jpg", true),
            "processed_my_tower.png"
        );
    }

    #[test]
    fn test_execute_writes_target_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PersistPipeline::new(Arc::new(Config::default()));

        let img = WorkingImage::Gray(GrayImage::from_pixel(400, 300, Luma([90])));
        let path = pipeline.execute(img, "processed_a.jpg", dir.path()).unwrap();

        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (90, 160));
        assert_eq!(saved.color(), image::ColorType::L8);
    }

    #[test]
    fn test_alpha_output_is_png() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PersistPipeline::new(Arc::new(Config::default()));

        let img = WorkingImage::GrayAlpha(GrayAlphaImage::from_pixel(50, 50, LumaA([90, 128])));
        let path = pipeline.execute(img, "processed_a.png", dir.path()).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Png);
        let saved = image::load_from_memory(&bytes).unwrap();
        assert_eq!(saved.color(), image::ColorType::La8);
    }

    #[test]
    fn test_alpha_tiff_input_is_saved_as_png() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PersistPipeline::new(Arc::new(Config::default()));

        let name = PersistPipeline::output_name("tower.tiff", true);
        assert_eq!(name, "processed_tower.png");

        let img = WorkingImage::GrayAlpha(GrayAlphaImage::from_pixel(50, 50, LumaA([90, 128])));
        let path = pipeline.execute(img, &name, dir.path()).unwrap();
        let saved = image::open(&path).unwrap();
        assert_eq!(saved.color(), image::ColorType::La8);
        assert_eq!((saved.width(), saved.height()), (90, 160));
    }

    #[test]
    fn test_cutout_name_and_save() {
        assert_eq!(PersistPipeline::cutout_name("my tower.jpg"), "my_tower.png");
        assert_eq!(PersistPipeline::cutout_name("sky.tree.jpeg"), "sky.tree.png");

        let dir = tempfile::tempdir().unwrap();
        let pipeline = PersistPipeline::new(Arc::new(Config::default()));
        let img = RgbaImage::from_pixel(33, 21, Rgba([200, 10, 10, 0]));
        let path = pipeline.save_cutout(img, "my_tower.png", dir.path()).unwrap();

        let saved = image::open(&path).unwrap();
        assert_eq!(saved.color(), image::ColorType::Rgba8);
        assert_eq!((saved.width(), saved.height()), (33, 21));
    }

    #[test]
    fn test_missing_directory_is_persist_error() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PersistPipeline::new(Arc::new(Config::default()));

        let img = WorkingImage::Gray(GrayImage::new(10, 10));
        let err = pipeline
            .execute(img, "processed_a.png", &dir.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::PersistFailed { .. }));
    }
}
