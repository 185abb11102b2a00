use crate::core::errors::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;

/// Upper bounds checked by `Config::validate`
const MAX_UPLOAD_MB: usize = 4096;
const MAX_EXTRACTED_MB: usize = 1 << 20;
const MAX_MODEL_SIDE: usize = 4096;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    pub max_upload_mb: usize,
    pub max_concurrent_jobs: usize,
}

/// Upload and output directory layout
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub max_archive_entries: usize,
    pub max_extracted_mb: u64,
}

/// Final output geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub target_width: u32,
    pub target_height: u32,
}

/// Random augmentation settings
#[derive(Debug, Clone)]
pub struct AugmentConfig {
    pub enabled: bool,
    /// Chance that each transform (rotate, scale, blur) is applied
    pub probability: f32,
    pub rotation_max_degrees: f32,
    pub scale_min: f32,
    pub scale_max: f32,
    pub blur_max_radius: f32,
    pub seed: Option<u64>,
}

/// Background removal model settings
#[derive(Debug, Clone)]
pub struct BackgroundConfig {
    pub enabled: bool,
    pub model_path: String,
    pub input_size: u32,
}

/// Landmark classifier model settings
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub model_path: String,
    pub input_width: u32,
    pub input_height: u32,
    /// Scores within this distance of 0.5 get no verdict
    pub undecided_margin: f32,
}

/// ONNX runtime settings
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub onnx_pool_size: usize,
    pub backend: Option<String>,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub output: OutputConfig,
    pub augment: AugmentConfig,
    pub background: BackgroundConfig,
    pub classifier: ClassifierConfig,
    pub inference: InferenceConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env();
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Self {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let defaults = Self::default();

        Self {
            server: ServerConfig {
                port: env_or("SERVER_PORT", defaults.server.port),
                host: env_string("SERVER_HOST", &defaults.server.host),
                log_level,
                max_upload_mb: env_or("MAX_UPLOAD_MB", defaults.server.max_upload_mb),
                max_concurrent_jobs: env_or(
                    "MAX_CONCURRENT_JOBS",
                    defaults.server.max_concurrent_jobs,
                ),
            },
            storage: StorageConfig {
                upload_dir: env::var("UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.upload_dir),
                processed_dir: env::var("PROCESSED_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.processed_dir),
                max_archive_entries: env_or(
                    "MAX_ARCHIVE_ENTRIES",
                    defaults.storage.max_archive_entries,
                ),
                max_extracted_mb: env_or("MAX_EXTRACTED_MB", defaults.storage.max_extracted_mb),
            },
            output: OutputConfig {
                target_width: env_or("TARGET_WIDTH", defaults.output.target_width),
                target_height: env_or("TARGET_HEIGHT", defaults.output.target_height),
            },
            augment: AugmentConfig {
                enabled: env_or("AUGMENT_ENABLED", defaults.augment.enabled),
                probability: env_or("AUGMENT_PROBABILITY", defaults.augment.probability),
                rotation_max_degrees: env_or(
                    "ROTATION_MAX_DEGREES",
                    defaults.augment.rotation_max_degrees,
                ),
                scale_min: env_or("SCALE_MIN", defaults.augment.scale_min),
                scale_max: env_or("SCALE_MAX", defaults.augment.scale_max),
                blur_max_radius: env_or("BLUR_MAX_RADIUS", defaults.augment.blur_max_radius),
                seed: env::var("AUGMENT_SEED").ok().and_then(|s| s.trim().parse().ok()),
            },
            background: BackgroundConfig {
                enabled: env_or("REMOVE_BACKGROUND", defaults.background.enabled),
                model_path: env_string("BACKGROUND_MODEL_PATH", &defaults.background.model_path),
                input_size: env_or("BACKGROUND_INPUT_SIZE", defaults.background.input_size),
            },
            classifier: ClassifierConfig {
                model_path: env_string("CLASSIFIER_MODEL_PATH", &defaults.classifier.model_path),
                input_width: env_or("CLASSIFIER_INPUT_WIDTH", defaults.classifier.input_width),
                input_height: env_or("CLASSIFIER_INPUT_HEIGHT", defaults.classifier.input_height),
                undecided_margin: env_or(
                    "CLASSIFIER_UNDECIDED_MARGIN",
                    defaults.classifier.undecided_margin,
                ),
            },
            inference: InferenceConfig {
                onnx_pool_size: env_or("ONNX_POOL_SIZE", defaults.inference.onnx_pool_size),
                backend: env::var("INFERENCE_BACKEND")
                    .ok()
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty() && s != "auto"),
            },
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.augment.probability) {
            return Err(ConfigError::InvalidProbability {
                name: "AUGMENT_PROBABILITY",
                value: self.augment.probability,
            });
        }

        if !(self.augment.scale_min > 0.0 && self.augment.scale_min <= self.augment.scale_max) {
            return Err(ConfigError::InvalidScaleRange {
                min: self.augment.scale_min,
                max: self.augment.scale_max,
            });
        }

        for (name, value) in [
            ("ROTATION_MAX_DEGREES", self.augment.rotation_max_degrees),
            ("BLUR_MAX_RADIUS", self.augment.blur_max_radius),
        ] {
            if !(value >= 0.0) {
                return Err(ConfigError::NegativeValue { name, value });
            }
        }

        for (name, value) in [
            ("TARGET_WIDTH", self.output.target_width as usize),
            ("TARGET_HEIGHT", self.output.target_height as usize),
            ("BACKGROUND_INPUT_SIZE", self.background.input_size as usize),
            ("CLASSIFIER_INPUT_WIDTH", self.classifier.input_width as usize),
            ("CLASSIFIER_INPUT_HEIGHT", self.classifier.input_height as usize),
            ("ONNX_POOL_SIZE", self.inference.onnx_pool_size),
            ("MAX_CONCURRENT_JOBS", self.server.max_concurrent_jobs),
            ("MAX_UPLOAD_MB", self.server.max_upload_mb),
            ("MAX_ARCHIVE_ENTRIES", self.storage.max_archive_entries),
            ("MAX_EXTRACTED_MB", self.storage.max_extracted_mb as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroValue { name, value });
            }
        }

        for (name, value, max) in [
            ("MAX_UPLOAD_MB", self.server.max_upload_mb, MAX_UPLOAD_MB),
            ("MAX_EXTRACTED_MB", self.storage.max_extracted_mb as usize, MAX_EXTRACTED_MB),
            ("BACKGROUND_INPUT_SIZE", self.background.input_size as usize, MAX_MODEL_SIDE),
            ("CLASSIFIER_INPUT_WIDTH", self.classifier.input_width as usize, MAX_MODEL_SIDE),
            ("CLASSIFIER_INPUT_HEIGHT", self.classifier.input_height as usize, MAX_MODEL_SIDE),
        ] {
            if value > max {
                return Err(ConfigError::TooLarge { name, value, max });
            }
        }

        if !(0.0..=0.5).contains(&self.classifier.undecided_margin) {
            return Err(ConfigError::InvalidMargin(self.classifier.undecided_margin));
        }

        for dir in [&self.storage.upload_dir, &self.storage.processed_dir] {
            if dir.exists() && !dir.is_dir() {
                return Err(ConfigError::InvalidDirectory {
                    path: dir.display().to_string(),
                    reason: "exists and is not a directory".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn upload_dir(&self) -> &Path {
        &self.storage.upload_dir
    }

    pub fn processed_dir(&self) -> &Path {
        &self.storage.processed_dir
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn max_extracted_bytes(&self) -> u64 {
        self.storage.max_extracted_mb.saturating_mul(1024 * 1024)
    }

    pub fn onnx_pool_size(&self) -> usize {
        self.inference.onnx_pool_size
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.server.max_concurrent_jobs
    }
}

impl Default for Config {
    /// Built-in defaults, before any environment overrides
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 5000,
                host: "0.0.0.0".to_string(),
                log_level: Level::INFO,
                max_upload_mb: 200,
                max_concurrent_jobs: 4,
            },
            storage: StorageConfig {
                upload_dir: PathBuf::from("uploads"),
                processed_dir: PathBuf::from("processed"),
                max_archive_entries: 10_000,
                max_extracted_mb: 2048,
            },
            output: OutputConfig {
                target_width: 90,
                target_height: 160,
            },
            augment: AugmentConfig {
                enabled: false,
                probability: 0.5,
                rotation_max_degrees: 360.0,
                scale_min: 0.8,
                scale_max: 1.2,
                blur_max_radius: 5.0,
                seed: None,
            },
            background: BackgroundConfig {
                enabled: false,
                model_path: "models/u2net.onnx".to_string(),
                input_size: 320,
            },
            classifier: ClassifierConfig {
                model_path: "models/landmark.onnx".to_string(),
                input_width: 160,
                input_height: 90,
                undecided_margin: 0.0,
            },
            inference: InferenceConfig {
                // Half the cores, at least 2
                onnx_pool_size: std::cmp::max(num_cpus::get() / 2, 2),
                backend: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.output.target_width, 90);
        assert_eq!(config.output.target_height, 160);
        assert_eq!(config.max_upload_bytes(), 200 * 1024 * 1024);
    }

    #[test]
    fn test_rejects_bad_probability() {
        let mut config = Config::default();
        config.augment.probability = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProbability { .. })
        ));
    }

    #[test]
    fn test_rejects_inverted_scale_range() {
        let mut config = Config::default();
        config.augment.scale_min = 1.3;
        config.augment.scale_max = 1.2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidScaleRange { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_target() {
        let mut config = Config::default();
        config.output.target_height = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroValue { name: "TARGET_HEIGHT", .. })
        ));
    }

    #[test]
    fn test_rejects_oversized_limits() {
        let mut config = Config::default();
        config.server.max_upload_mb = usize::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge { name: "MAX_UPLOAD_MB", .. })
        ));
        assert_eq!(config.max_upload_bytes(), usize::MAX);

        let mut config = Config::default();
        config.storage.max_extracted_mb = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge { name: "MAX_EXTRACTED_MB", .. })
        ));
        assert_eq!(config.max_extracted_bytes(), u64::MAX);

        let mut config = Config::default();
        config.background.input_size = 100_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge { name: "BACKGROUND_INPUT_SIZE", .. })
        ));
    }

    #[test]
    fn test_rejects_margin_above_half() {
        let mut config = Config::default();
        config.classifier.undecided_margin = 0.6;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMargin(_))));
    }

    #[test]
    fn test_rejects_file_as_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut config = Config::default();
        config.storage.processed_dir = file.path().to_path_buf();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDirectory { .. })
        ));
    }
}
