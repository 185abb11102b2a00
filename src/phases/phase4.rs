// Phase 4: Landmark Classification

use image::GrayImage;
use std::sync::Arc;
use tracing::instrument;

use crate::core::config::Config;
use crate::core::errors::{ErrorContext, InferenceError, PipelineResult};
use crate::core::types::Classification;
use crate::services::classifier::LandmarkClassifier;

/// Phase 4 pipeline: Tower / Skytree verdict on the normalized grayscale image
pub struct ClassifyPipeline {
    classifier: Option<Arc<LandmarkClassifier>>,
    model_path: String,
}

impl ClassifyPipeline {
    pub fn new(config: &Config, classifier: Option<Arc<LandmarkClassifier>>) -> Self {
        Self {
            classifier,
            model_path: config.classifier.model_path.clone(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.classifier.is_some()
    }

    #[instrument(skip(self, gray), fields(filename = %filename))]
    pub fn execute(&self, gray: &GrayImage, filename: &str) -> PipelineResult<Classification> {
        let classifier = self
            .classifier
            .as_ref()
            .ok_or_else(|| InferenceError::ModelUnavailable {
                model: "classifier",
                path: self.model_path.clone(),
            })
            .with_file_context(filename)?;

        classifier.classify(gray).with_file_context(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::PipelineError;

    #[test]
    fn test_missing_model_is_reported_per_file() {
        let pipeline = ClassifyPipeline::new(&Config::default(), None);
        assert!(!pipeline.is_available());

        let err = pipeline.execute(&GrayImage::new(4, 4), "tower.jpg").unwrap_err();
        match err {
            PipelineError::ClassificationFailed { filename, source } => {
                assert_eq!(filename, "tower.jpg");
                assert!(matches!(source, InferenceError::ModelUnavailable { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
