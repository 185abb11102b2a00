pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{ArchiveError, ConfigError, InferenceError, JobError, PipelineError};
pub use types::{
    AugmentationRecord, BatchAnalytics, BatchResult, Classification, FileResult, ImageData,
    JobOptions, PerformanceMetrics, Prediction, ProcessingConfig, Verdict,
};
