// Library exports for the landmark photo preprocessing workflow

// Core modules
pub mod core;
pub mod orchestration;
pub mod phases;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{ArchiveError, ConfigError, InferenceError, JobError, PipelineError},
    types::{
        AugmentationRecord, BatchResult, Classification, FileResult, ImageData, JobOptions,
        PerformanceMetrics, Prediction, ProcessingConfig, Verdict,
    },
};

pub use orchestration::BatchOrchestrator;

pub use phases::{AugmentPipeline, ClassifyPipeline, NormalizePipeline, PersistPipeline, WorkingImage};

pub use services::{BackgroundRemover, LandmarkClassifier};

pub use utils::{decode_oriented, extract_zip, Metrics};
