// Phase 1: Decode & Normalize Pipeline

use image::{DynamicImage, GrayImage, ImageError, RgbaImage};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::errors::{ErrorContext, PipelineError, PipelineResult};
use crate::core::types::ImageData;
use crate::phases::WorkingImage;
use crate::services::background::BackgroundRemover;
use crate::utils::image_ops::{attach_alpha, decode_oriented, to_grayscale};

/// Phase 1 output
pub struct Phase1Output {
    /// Image handed to augmentation (alpha only if background was removed)
    pub working: WorkingImage,
    /// Plain grayscale view, used by the classifier
    pub gray: GrayImage,
}

/// Phase 1 pipeline: EXIF orientation, grayscale, optional background removal
pub struct NormalizePipeline {
    remover: Option<Arc<BackgroundRemover>>,
}

impl NormalizePipeline {
    pub fn new(remover: Option<Arc<BackgroundRemover>>) -> Self {
        Self { remover }
    }

    pub fn can_remove_background(&self) -> bool {
        self.remover.is_some()
    }

    /// Read and normalize one file from disk
    #[instrument(skip(self, image_data), fields(
        index = image_data.index,
        filename = %image_data.filename
    ))]
    pub fn execute(
        &self,
        image_data: &ImageData,
        remove_background: bool,
    ) -> PipelineResult<Phase1Output> {
        let oriented = read_oriented(image_data)?;
        self.normalize(&oriented, &image_data.filename, remove_background)
    }

    /// Colour cutout of one file: oriented RGB with the foreground mask as alpha
    #[instrument(skip(self, image_data), fields(
        index = image_data.index,
        filename = %image_data.filename
    ))]
    pub fn cutout(&self, image_data: &ImageData) -> PipelineResult<RgbaImage> {
        let oriented = read_oriented(image_data)?;
        self.remover(&image_data.filename)?
            .remove_background(&oriented)
            .with_file_context(&image_data.filename)
    }

    fn remover(&self, filename: &str) -> PipelineResult<&BackgroundRemover> {
        self.remover
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("background model is not loaded"))
            .with_file_context(filename)
    }

    /// Normalize an already-decoded, already-oriented image
    pub fn normalize(
        &self,
        oriented: &DynamicImage,
        filename: &str,
        remove_background: bool,
    ) -> PipelineResult<Phase1Output> {
        debug!(
            "Normalizing {} ({}x{}, {:?})",
            filename,
            oriented.width(),
            oriented.height(),
            oriented.color()
        );
        let gray = to_grayscale(oriented);

        let working = if remove_background {
            let remover = self.remover(filename)?;

            // Segment on colour, the model was trained on RGB
            let mask = remover.predict_mask(oriented).with_file_context(filename)?;
            WorkingImage::GrayAlpha(attach_alpha(&gray, &mask).with_file_context(filename)?)
        } else {
            WorkingImage::Gray(gray.clone())
        };

        Ok(Phase1Output { working, gray })
    }
}

fn read_oriented(image_data: &ImageData) -> PipelineResult<DynamicImage> {
    let bytes = std::fs::read(&image_data.path).map_err(|e| PipelineError::DecodeFailed {
        filename: image_data.filename.clone(),
        source: ImageError::IoError(e),
    })?;
    decode_oriented(&bytes).map_err(|e| PipelineError::DecodeFailed {
        filename: image_data.filename.clone(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::image_ops::tests::jpeg_with_orientation;
    use image::{Rgb, RgbImage};

    fn image_data(path: std::path::PathBuf) -> ImageData {
        ImageData {
            index: 0,
            filename: path.file_name().unwrap().to_string_lossy().to_string(),
            path,
        }
    }

    #[test]
    fn test_execute_orients_and_grayscales() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tower.jpg");
        let img = RgbImage::from_pixel(60, 20, Rgb([10, 200, 30]));
        std::fs::write(&path, jpeg_with_orientation(&img, 6)).unwrap();

        let output = NormalizePipeline::new(None)
            .execute(&image_data(path), false)
            .unwrap();

        assert_eq!(output.gray.dimensions(), (20, 60));
        assert!(!output.working.has_alpha());
        assert_eq!(output.working.dimensions(), (20, 60));
    }

    #[test]
    fn test_execute_reports_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"not an image").unwrap();

        let err = NormalizePipeline::new(None)
            .execute(&image_data(path), false)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::DecodeFailed { ref filename, .. } if filename == "notes.txt"));
    }

    #[test]
    fn test_background_removal_without_model_fails() {
        let pipeline = NormalizePipeline::new(None);
        assert!(!pipeline.can_remove_background());

        let img = DynamicImage::new_rgb8(4, 4);
        let err = pipeline.normalize(&img, "a.png", true).err().unwrap();
        assert!(matches!(err, PipelineError::BackgroundRemovalFailed { .. }));
    }

    #[test]
    fn test_cutout_without_model_fails_after_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tower.jpg");
        std::fs::write(&path, jpeg_with_orientation(&RgbImage::new(8, 8), 1)).unwrap();

        let err = NormalizePipeline::new(None).cutout(&image_data(path)).unwrap_err();
        assert!(matches!(err, PipelineError::BackgroundRemovalFailed { .. }));

        let missing = dir.path().join("gone.jpg");
        let err = NormalizePipeline::new(None).cutout(&image_data(missing)).unwrap_err();
        assert!(matches!(err, PipelineError::DecodeFailed { .. }));
    }
}
