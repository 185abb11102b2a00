// Shared types for the preprocessing workflow

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Per-request overrides; unset fields fall back to the server config
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProcessingConfig {
    pub augment: Option<bool>,
    pub remove_background: Option<bool>,
    pub classify: Option<bool>,
    /// Colour cutouts instead of the grayscale pipeline
    pub cutout: Option<bool>,
    pub seed: Option<u64>,
}

/// One input file of a job
#[derive(Debug, Clone)]
pub struct ImageData {
    pub index: usize,
    pub filename: String,
    pub path: PathBuf,
}

/// Resolved switches for a single job
#[derive(Debug, Clone, Copy, Default)]
pub struct JobOptions {
    pub augment: bool,
    pub remove_background: bool,
    pub classify: bool,
    pub cutout: bool,
    pub seed: Option<u64>,
}

/// Random transforms applied to one image
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AugmentationRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_degrees: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blur_radius: Option<f32>,
}

impl AugmentationRecord {
    pub fn is_identity(&self) -> bool {
        self.rotation_degrees.is_none() && self.scale_factor.is_none() && self.blur_radius.is_none()
    }
}

/// Classifier decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Tower,
    Skytree,
    None,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Tower => "Tokyo Tower",
            Verdict::Skytree => "Tokyo Skytree",
            Verdict::None => "none",
        }
    }
}

/// Classification of a single photograph
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub tower_percent: f32,
    pub skytree_percent: f32,
    pub verdict: Verdict,
}

/// Individual file result
#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub index: usize,
    pub filename: String,
    pub success: bool,
    pub processing_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub augmentation: Option<AugmentationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileResult {
    pub fn failed(image: &ImageData, error: String, elapsed: Duration) -> Self {
        Self {
            index: image.index,
            filename: image.filename.clone(),
            success: false,
            processing_time_ms: elapsed.as_secs_f64() * 1000.0,
            output_name: None,
            output_url: None,
            augmentation: None,
            classification: None,
            error: Some(error),
        }
    }
}

/// Single-image prediction with an inline preview of the processed image
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub job_id: String,
    #[serde(flatten)]
    pub result: FileResult,
    pub preview: String,
}

/// Batch-level counters and stage timings
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchAnalytics {
    pub total_files: usize,
    pub rotations: usize,
    pub scalings: usize,
    pub blurs: usize,
    pub background_removals: usize,
    pub classifications: usize,
    pub normalize_time_ms: f64,
    pub augment_time_ms: f64,
    pub persist_time_ms: f64,
    pub classify_time_ms: f64,
    pub total_time_ms: f64,
}

/// Batch processing result
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub job_id: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub processing_time_ms: f64,
    pub average_time_per_file_ms: f64,
    pub analytics: BatchAnalytics,
    pub results: Vec<FileResult>,
}

/// Stage timings and counters for one file, merged into BatchAnalytics
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub normalize_time: Duration,
    pub augment_time: Duration,
    pub persist_time: Duration,
    pub classify_time: Duration,
    pub rotations: usize,
    pub scalings: usize,
    pub blurs: usize,
    pub background_removals: usize,
    pub classifications: usize,
}

impl PerformanceMetrics {
    pub fn merge(&mut self, other: &PerformanceMetrics) {
        self.normalize_time += other.normalize_time;
        self.augment_time += other.augment_time;
        self.persist_time += other.persist_time;
        self.classify_time += other.classify_time;
        self.rotations += other.rotations;
        self.scalings += other.scalings;
        self.blurs += other.blurs;
        self.background_removals += other.background_removals;
        self.classifications += other.classifications;
    }

    pub fn record_augmentation(&mut self, record: &AugmentationRecord) {
        self.rotations += record.rotation_degrees.is_some() as usize;
        self.scalings += record.scale_factor.is_some() as usize;
        self.blurs += record.blur_radius.is_some() as usize;
    }

    pub fn into_analytics(self, total_files: usize, total_time: Duration) -> BatchAnalytics {
        BatchAnalytics {
            total_files,
            rotations: self.rotations,
            scalings: self.scalings,
            blurs: self.blurs,
            background_removals: self.background_removals,
            classifications: self.classifications,
            normalize_time_ms: self.normalize_time.as_secs_f64() * 1000.0,
            augment_time_ms: self.augment_time.as_secs_f64() * 1000.0,
            persist_time_ms: self.persist_time.as_secs_f64() * 1000.0,
            classify_time_ms: self.classify_time.as_secs_f64() * 1000.0,
            total_time_ms: total_time.as_secs_f64() * 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_and_augmentation_counts() {
        let mut total = PerformanceMetrics::default();
        let mut one = PerformanceMetrics::default();
        one.record_augmentation(&AugmentationRecord {
            rotation_degrees: Some(42.0),
            scale_factor: None,
            blur_radius: Some(1.5),
        });
        one.normalize_time = Duration::from_millis(3);
        total.merge(&one);
        total.merge(&one);

        assert_eq!(total.rotations, 2);
        assert_eq!(total.scalings, 0);
        assert_eq!(total.blurs, 2);

        let analytics = total.into_analytics(2, Duration::from_millis(10));
        assert_eq!(analytics.normalize_time_ms, 6.0);
        assert_eq!(analytics.total_time_ms, 10.0);
    }

    #[test]
    fn test_processing_config_partial_json() {
        let config: ProcessingConfig = serde_json::from_str(r#"{"augment": true}"#).unwrap();
        assert_eq!(config.augment, Some(true));
        assert!(config.remove_background.is_none());
        assert!(config.cutout.is_none());
    }

    #[test]
    fn test_verdict_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Verdict::Skytree).unwrap(), "\"skytree\"");
        assert_eq!(Verdict::None.label(), "none");
    }
}
