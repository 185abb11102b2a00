pub mod phase1;
pub mod phase2;
pub mod phase3;
pub mod phase4;

pub use phase1::{NormalizePipeline, Phase1Output};
pub use phase2::AugmentPipeline;
pub use phase3::PersistPipeline;
pub use phase4::ClassifyPipeline;

use image::{DynamicImage, GrayAlphaImage, GrayImage};

/// Grayscale image flowing through the pipeline.
///
/// Gains an alpha channel only when the background was removed.
#[derive(Debug, Clone)]
pub enum WorkingImage {
    Gray(GrayImage),
    GrayAlpha(GrayAlphaImage),
}

impl WorkingImage {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            WorkingImage::Gray(img) => img.dimensions(),
            WorkingImage::GrayAlpha(img) => img.dimensions(),
        }
    }

    pub fn has_alpha(&self) -> bool {
        matches!(self, WorkingImage::GrayAlpha(_))
    }

    pub fn into_dynamic(self) -> DynamicImage {
        match self {
            WorkingImage::Gray(img) => DynamicImage::ImageLuma8(img),
            WorkingImage::GrayAlpha(img) => DynamicImage::ImageLumaA8(img),
        }
    }
}
