// Typed errors for the preprocessing workflow
//
// Services use anyhow internally; these enums are the boundaries the
// orchestrator and the HTTP layer match on.

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Probability must be in [0.0, 1.0], got {name}={value}")]
    InvalidProbability { name: &'static str, value: f32 },

    #[error("Invalid scale range: min={min}, max={max} (need 0 < min <= max)")]
    InvalidScaleRange { min: f32, max: f32 },

    #[error("{name} must be >= 0, got {value}")]
    NegativeValue { name: &'static str, value: f32 },

    #[error("{name} must be > 0, got {value}")]
    ZeroValue { name: &'static str, value: usize },

    #[error("{name} must be <= {max}, got {value}")]
    TooLarge {
        name: &'static str,
        value: usize,
        max: usize,
    },

    #[error("Undecided margin must be in [0.0, 0.5], got {0}")]
    InvalidMargin(f32),

    #[error("Invalid directory {path}: {reason}")]
    InvalidDirectory { path: String, reason: String },
}

/// Upload archive errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Uploaded file is not a ZIP archive")]
    NotAZip,

    #[error("Corrupt ZIP archive: {0}")]
    Corrupt(#[from] zip::result::ZipError),

    #[error("Archive has {count} entries (limit {limit})")]
    TooManyEntries { count: usize, limit: usize },

    #[error("Archive expands to more than {limit_bytes} bytes")]
    TooLarge { limit_bytes: u64 },

    #[error("Archive contains no files")]
    Empty,

    #[error("I/O error while extracting {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Model inference errors
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{model} model is not loaded (expected at {path})")]
    ModelUnavailable { model: &'static str, path: String },

    #[error("ONNX inference failed: {0}")]
    Ort(#[from] ort::Error),

    #[error("No inference session available: {0}")]
    SessionUnavailable(String),

    #[error("Unexpected model output: {0}")]
    UnexpectedOutput(String),
}

/// Per-file pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to decode {filename}: {source}")]
    DecodeFailed {
        filename: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Image operation failed on {filename}: {reason}")]
    ImageFailed { filename: String, reason: String },

    #[error("Background removal failed on {filename}: {source}")]
    BackgroundRemovalFailed {
        filename: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to write {path}: {source}")]
    PersistFailed {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Classification failed on {filename}: {source}")]
    ClassificationFailed {
        filename: String,
        #[source]
        source: InferenceError,
    },
}

/// Job-level errors that abort a whole request
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),

    #[error("Job queue is closed")]
    QueueClosed,
}

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ArchiveResult<T> = Result<T, ArchiveError>;
pub type InferenceResult<T> = Result<T, InferenceError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type JobResult<T> = Result<T, JobError>;

/// Attach the filename to errors raised inside a pipeline phase
pub trait ErrorContext<T> {
    fn with_file_context(self, filename: &str) -> PipelineResult<T>;
}

impl<T> ErrorContext<T> for InferenceResult<T> {
    fn with_file_context(self, filename: &str) -> PipelineResult<T> {
        self.map_err(|e| PipelineError::ClassificationFailed {
            filename: filename.to_string(),
            source: e,
        })
    }
}

impl<T> ErrorContext<T> for anyhow::Result<T> {
    fn with_file_context(self, filename: &str) -> PipelineResult<T> {
        self.map_err(|e| PipelineError::BackgroundRemovalFailed {
            filename: filename.to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_context_wraps_inference_error() {
        let result: InferenceResult<()> =
            Err(InferenceError::UnexpectedOutput("empty tensor".to_string()));
        let err = result.with_file_context("tower.jpg").unwrap_err();
        assert!(matches!(err, PipelineError::ClassificationFailed { .. }));
        assert!(err.to_string().contains("tower.jpg"));
    }

    #[test]
    fn test_archive_error_message() {
        let err = ArchiveError::TooManyEntries { count: 20, limit: 10 };
        assert_eq!(err.to_string(), "Archive has 20 entries (limit 10)");
    }
}
