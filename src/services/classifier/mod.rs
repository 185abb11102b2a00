// Landmark classifier: Tokyo Tower vs Tokyo Skytree
//
// Consumes the Keras CNN exported to ONNX. Input is NHWC [1, H, W, 1]
// grayscale in [0, 1]; output is one sigmoid score for "Tokyo Tower".

use anyhow::Context;
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::value::Tensor;
use std::path::Path;
use tracing::{debug, info, instrument};

use crate::core::config::Config;
use crate::core::errors::{InferenceError, InferenceResult};
use crate::core::types::{Classification, Verdict};
use crate::services::onnx_builder::{self, Backend, SessionPool};

pub struct LandmarkClassifier {
    pool: SessionPool,
    input_width: u32,
    input_height: u32,
    undecided_margin: f32,
}

impl LandmarkClassifier {
    #[instrument(skip(config), fields(model = %config.classifier.model_path))]
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let model_bytes =
            onnx_builder::load_model_bytes(Path::new(&config.classifier.model_path), "classifier")?;
        let pool = SessionPool::build(
            &model_bytes,
            "classifier",
            config.onnx_pool_size(),
            config.inference.backend.as_deref(),
        )?;

        let classifier = Self {
            pool,
            input_width: config.classifier.input_width,
            input_height: config.classifier.input_height,
            undecided_margin: config.classifier.undecided_margin,
        };

        classifier
            .score(&GrayImage::new(classifier.input_width, classifier.input_height))
            .context("Classifier warmup failed")?;
        info!(
            "✓ Classifier ready ({}x{} input)",
            classifier.input_width, classifier.input_height
        );
        Ok(classifier)
    }

    pub fn backend(&self) -> Backend {
        self.pool.backend()
    }

    /// Raw sigmoid score that the photo shows Tokyo Tower
    pub fn score(&self, gray: &GrayImage) -> InferenceResult<f32> {
        let input = Tensor::from_array(preprocess(gray, self.input_width, self.input_height))?;

        let score = {
            let mut session = self
                .pool
                .acquire()
                .map_err(|e| InferenceError::SessionUnavailable(e.to_string()))?;
            let outputs = session.run(ort::inputs![input])?;
            let (_shape, data) = outputs[0].try_extract_tensor::<f32>()?;
            data.first().copied()
        };

        score.ok_or_else(|| {
            InferenceError::UnexpectedOutput("classifier returned an empty tensor".to_string())
        })
    }

    #[instrument(skip(self, gray), fields(width = gray.width(), height = gray.height()))]
    pub fn classify(&self, gray: &GrayImage) -> InferenceResult<Classification> {
        let score = self.score(gray)?;
        debug!("Tower score: {:.4}", score);
        interpret_score(score, self.undecided_margin)
    }
}

/// Resize to the network input and scale to [0, 1] in NHWC layout.
pub fn preprocess(gray: &GrayImage, width: u32, height: u32) -> Array4<f32> {
    let resized = if gray.dimensions() == (width, height) {
        gray.clone()
    } else {
        image::imageops::resize(gray, width, height, FilterType::Lanczos3)
    };

    let mut tensor = Array4::<f32>::zeros((1, height as usize, width as usize, 1));
    for (x, y, pixel) in resized.enumerate_pixels() {
        tensor[[0, y as usize, x as usize, 0]] = pixel[0] as f32 / 255.0;
    }
    tensor
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// Convert the tower score into percentages and a verdict.
///
/// Scores within `margin` of 0.5 are too close to call and get `Verdict::None`.
pub fn interpret_score(score: f32, margin: f32) -> InferenceResult<Classification> {
    if !score.is_finite() {
        return Err(InferenceError::UnexpectedOutput(format!(
            "non-finite score {}",
            score
        )));
    }

    let p = score.clamp(0.0, 1.0);
    let tower_percent = round2(p * 100.0);
    let skytree_percent = round2(100.0 - tower_percent);

    let verdict = if (p - 0.5).abs() < margin {
        Verdict::None
    } else if p >= 0.5 {
        Verdict::Tower
    } else {
        Verdict::Skytree
    };

    Ok(Classification {
        tower_percent,
        skytree_percent,
        verdict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_interpret_confident_tower() {
        let c = interpret_score(0.8, 0.0).unwrap();
        assert_eq!(c.verdict, Verdict::Tower);
        assert!((c.tower_percent - 80.0).abs() < 1e-4);
        assert!((c.skytree_percent - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_interpret_skytree_rounds_to_two_places() {
        let c = interpret_score(0.123456, 0.0).unwrap();
        assert_eq!(c.verdict, Verdict::Skytree);
        assert!((c.tower_percent - 12.35).abs() < 1e-3);
        assert!((c.skytree_percent - 87.65).abs() < 1e-3);
    }

    #[test]
    fn test_interpret_close_call_is_none() {
        assert_eq!(interpret_score(0.52, 0.05).unwrap().verdict, Verdict::None);
        assert_eq!(interpret_score(0.6, 0.05).unwrap().verdict, Verdict::Tower);
    }

    #[test]
    fn test_interpret_exact_half_without_margin_is_tower() {
        assert_eq!(interpret_score(0.5, 0.0).unwrap().verdict, Verdict::Tower);
    }

    #[test]
    fn test_interpret_rejects_nan() {
        assert!(matches!(
            interpret_score(f32::NAN, 0.0),
            Err(InferenceError::UnexpectedOutput(_))
        ));
    }

    #[test]
    fn test_preprocess_layout_and_scale() {
        let mut gray = GrayImage::from_pixel(160, 90, Luma([0]));
        gray.put_pixel(159, 0, Luma([255]));
        let tensor = preprocess(&gray, 160, 90);
        assert_eq!(tensor.shape(), &[1, 90, 160, 1]);
        assert_eq!(tensor[[0, 0, 159, 0]], 1.0);
        assert_eq!(tensor[[0, 1, 0, 0]], 0.0);
    }

    #[test]
    fn test_preprocess_resizes_other_shapes() {
        let gray = GrayImage::from_pixel(90, 160, Luma([255]));
        let tensor = preprocess(&gray, 160, 90);
        assert_eq!(tensor.shape(), &[1, 90, 160, 1]);
        assert!(tensor.iter().all(|&v| (v - 1.0).abs() < 0.02));
    }
}
