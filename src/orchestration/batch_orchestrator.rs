// Batch Orchestrator: Main workflow coordinator

use anyhow::Context;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::errors::{
    ArchiveError, InferenceError, JobError, JobResult, PipelineError, PipelineResult,
};
use crate::core::types::{
    AugmentationRecord, BatchResult, Classification, FileResult, ImageData, JobOptions,
    PerformanceMetrics, Prediction, ProcessingConfig,
};
use crate::phases::{
    AugmentPipeline, ClassifyPipeline, NormalizePipeline, PersistPipeline, Phase1Output,
    WorkingImage,
};
use crate::services::background::BackgroundRemover;
use crate::services::classifier::LandmarkClassifier;
use crate::utils::archive::{extract_zip, is_zip, secure_filename, ExtractLimits};
use crate::utils::image_ops::{decode_oriented, encode_png, to_data_url, to_grayscale};
use crate::utils::metrics::{Metrics, Stage};

/// Phase pipelines shared by every job
#[derive(Clone)]
struct Pipelines {
    normalize: Arc<NormalizePipeline>,
    augment: Arc<AugmentPipeline>,
    persist: Arc<PersistPipeline>,
    classify: Arc<ClassifyPipeline>,
    metrics: Metrics,
}

/// Main batch orchestrator
pub struct BatchOrchestrator {
    config: Arc<Config>,
    pipelines: Pipelines,
    job_semaphore: Arc<Semaphore>,
    backend_type: String,
}

impl BatchOrchestrator {
    /// Create the output directories and load whichever models are present
    #[instrument(skip(config, metrics))]
    pub async fn new(config: Arc<Config>, metrics: Metrics) -> anyhow::Result<Self> {
        for dir in [config.upload_dir(), config.processed_dir()] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        info!("Loading models...");
        let model_config = Arc::clone(&config);
        let (remover, classifier) = tokio::task::spawn_blocking(move || {
            (
                load_optional("Background removal", || BackgroundRemover::new(&model_config)),
                load_optional("Classifier", || LandmarkClassifier::new(&model_config)),
            )
        })
        .await
        .context("Model loading task failed")?;

        let backend_type = match (&remover, &classifier) {
            (_, Some(c)) => c.backend().name().to_string(),
            (Some(r), None) => r.backend().name().to_string(),
            (None, None) => "none".to_string(),
        };

        Ok(Self::with_services(config, metrics, remover, classifier, backend_type))
    }

    /// Assemble an orchestrator from already-loaded services
    pub fn with_services(
        config: Arc<Config>,
        metrics: Metrics,
        remover: Option<Arc<BackgroundRemover>>,
        classifier: Option<Arc<LandmarkClassifier>>,
        backend_type: String,
    ) -> Self {
        let pipelines = Pipelines {
            normalize: Arc::new(NormalizePipeline::new(remover)),
            augment: Arc::new(AugmentPipeline::new(Arc::clone(&config))),
            persist: Arc::new(PersistPipeline::new(Arc::clone(&config))),
            classify: Arc::new(ClassifyPipeline::new(&config, classifier)),
            metrics,
        };
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs()));

        info!(
            "✓ Ready (jobs: {}, background: {}, classifier: {}, backend: {})",
            config.max_concurrent_jobs(),
            if pipelines.normalize.can_remove_background() { "loaded" } else { "missing" },
            if pipelines.classify.is_available() { "loaded" } else { "missing" },
            backend_type
        );

        Self {
            config,
            pipelines,
            job_semaphore,
            backend_type,
        }
    }

    /// Execution provider of the loaded models (e.g. "CUDA", "CPU")
    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    pub fn background_loaded(&self) -> bool {
        self.pipelines.normalize.can_remove_background()
    }

    pub fn classifier_loaded(&self) -> bool {
        self.pipelines.classify.is_available()
    }

    /// Merge request overrides with server defaults and check model availability
    pub fn resolve_options(&self, request: &ProcessingConfig) -> JobResult<JobOptions> {
        let cutout = request.cutout.unwrap_or(false);
        let options = if cutout {
            // Cutouts bypass the grayscale pipeline entirely
            JobOptions {
                cutout,
                ..JobOptions::default()
            }
        } else {
            JobOptions {
                augment: request.augment.unwrap_or(self.config.augment.enabled),
                remove_background: request
                    .remove_background
                    .unwrap_or(self.config.background.enabled),
                classify: request.classify.unwrap_or(self.classifier_loaded()),
                cutout,
                seed: request.seed.or(self.config.augment.seed),
            }
        };

        if (options.remove_background || options.cutout) && !self.background_loaded() {
            return Err(InferenceError::ModelUnavailable {
                model: "background",
                path: self.config.background.model_path.clone(),
            }
            .into());
        }
        if options.classify && !self.classifier_loaded() {
            return Err(InferenceError::ModelUnavailable {
                model: "classifier",
                path: self.config.classifier.model_path.clone(),
            }
            .into());
        }
        Ok(options)
    }

    /// Process one uploaded ZIP of photographs
    ///
    /// # Workflow:
    /// 1. Save the upload under `UPLOAD_DIR/<job_id>/`
    /// 2. Extract it (entry and size caps enforced)
    /// 3. Run phases 1-4 on every file in parallel on the rayon pool
    /// 4. Collect results in archive order
    #[instrument(skip(self, bytes, request), fields(upload = %upload_name, size = bytes.len()))]
    pub async fn process_archive(
        &self,
        bytes: Vec<u8>,
        upload_name: &str,
        request: &ProcessingConfig,
    ) -> JobResult<BatchResult> {
        let start_time = Instant::now();
        let options = self.resolve_options(request)?;
        if !is_zip(&bytes) {
            return Err(ArchiveError::NotAZip.into());
        }
        let _permit = self
            .job_semaphore
            .acquire()
            .await
            .map_err(|_| JobError::QueueClosed)?;

        let job_id = Uuid::new_v4().to_string();
        info!("Job {}: {:?}", job_id, options);
        self.pipelines.metrics.record_upload();

        let upload_dir = self.config.upload_dir().join(&job_id);
        let out_dir = self.config.processed_dir().join(&job_id);
        let archive_name = secure_filename(upload_name);
        let limits = ExtractLimits {
            max_entries: self.config.storage.max_archive_entries,
            max_total_bytes: self.config.max_extracted_bytes(),
        };
        let pipelines = self.pipelines.clone();
        let task_job_id = job_id.clone();

        let (results, perf) = tokio::task::spawn_blocking(move || -> JobResult<_> {
            std::fs::create_dir_all(&upload_dir)?;
            std::fs::write(upload_dir.join(&archive_name), &bytes)?;

            let extract_dir = upload_dir.join("extracted");
            let paths = extract_zip(&bytes, &extract_dir, limits)?;
            let images = collect_images(paths);
            info!("Job {}: extracted {} files", task_job_id, images.len());

            std::fs::create_dir_all(&out_dir)?;
            Ok(pipelines.run_images(&images, &out_dir, &task_job_id, options))
        })
        .await
        .map_err(|e| JobError::TaskJoinFailed(e.to_string()))??;

        Ok(summarize(job_id, results, perf, start_time.elapsed()))
    }

    /// Process the regular files of a local directory (non-recursive)
    ///
    /// Outputs land in `PROCESSED_DIR/<job_id>/` exactly as for an upload.
    #[instrument(skip(self, request), fields(dir = %dir.display()))]
    pub async fn process_directory(
        &self,
        dir: &Path,
        request: &ProcessingConfig,
    ) -> JobResult<BatchResult> {
        let start_time = Instant::now();
        let options = self.resolve_options(request)?;
        let _permit = self
            .job_semaphore
            .acquire()
            .await
            .map_err(|_| JobError::QueueClosed)?;

        let job_id = Uuid::new_v4().to_string();
        info!("Job {}: {:?}", job_id, options);

        let dir = dir.to_path_buf();
        let out_dir = self.config.processed_dir().join(&job_id);
        let pipelines = self.pipelines.clone();
        let task_job_id = job_id.clone();

        let (results, perf) = tokio::task::spawn_blocking(move || -> JobResult<_> {
            let mut paths = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                let hidden = path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(true);
                if path.is_file() && !hidden {
                    paths.push(path);
                }
            }
            paths.sort();
            let images = collect_images(paths);
            info!("Job {}: found {} files", task_job_id, images.len());

            std::fs::create_dir_all(&out_dir)?;
            Ok(pipelines.run_images(&images, &out_dir, &task_job_id, options))
        })
        .await
        .map_err(|e| JobError::TaskJoinFailed(e.to_string()))??;

        Ok(summarize(job_id, results, perf, start_time.elapsed()))
    }

    /// Classify one uploaded photograph
    ///
    /// Orients, resizes to the target, converts to grayscale, saves the result
    /// and classifies it.
    #[instrument(skip(self, bytes), fields(upload = %upload_name, size = bytes.len()))]
    pub async fn process_single(&self, bytes: Vec<u8>, upload_name: &str) -> JobResult<Prediction> {
        if !self.classifier_loaded() {
            return Err(InferenceError::ModelUnavailable {
                model: "classifier",
                path: self.config.classifier.model_path.clone(),
            }
            .into());
        }
        let _permit = self
            .job_semaphore
            .acquire()
            .await
            .map_err(|_| JobError::QueueClosed)?;

        let job_id = Uuid::new_v4().to_string();
        self.pipelines.metrics.record_upload();

        let filename = secure_filename(upload_name);
        let upload_dir = self.config.upload_dir().join(&job_id);
        let out_dir = self.config.processed_dir().join(&job_id);
        let target = (
            self.config.output.target_width,
            self.config.output.target_height,
        );
        let pipelines = self.pipelines.clone();
        let task_job_id = job_id.clone();

        let (result, preview) = tokio::task::spawn_blocking(move || -> JobResult<_> {
            std::fs::create_dir_all(&upload_dir)?;
            std::fs::write(upload_dir.join(&filename), &bytes)?;
            pipelines.predict(&bytes, filename, &out_dir, &task_job_id, target)
        })
        .await
        .map_err(|e| JobError::TaskJoinFailed(e.to_string()))??;

        info!(
            "Prediction {}: {} ({:.2}ms)",
            job_id,
            result
                .classification
                .map(|c| c.verdict.label())
                .unwrap_or("none"),
            result.processing_time_ms
        );

        Ok(Prediction {
            job_id,
            result,
            preview,
        })
    }
}

impl Pipelines {
    /// Orient, resize, grayscale, persist and classify one photograph
    fn predict(
        &self,
        bytes: &[u8],
        filename: String,
        out_dir: &Path,
        job_id: &str,
        target: (u32, u32),
    ) -> JobResult<(FileResult, String)> {
        let start = Instant::now();
        match self.try_predict(bytes, &filename, out_dir, target) {
            Ok((output_name, classification, preview)) => {
                self.metrics.record_file(true);
                let result = FileResult {
                    index: 0,
                    processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                    output_url: Some(output_url(job_id, &output_name)),
                    output_name: Some(output_name),
                    augmentation: None,
                    classification: Some(classification),
                    error: None,
                    success: true,
                    filename,
                };
                Ok((result, preview))
            }
            Err(e) => {
                warn!("Failed to classify {}: {}", filename, e);
                self.metrics.record_file(false);
                Err(e.into())
            }
        }
    }

    fn try_predict(
        &self,
        bytes: &[u8],
        filename: &str,
        out_dir: &Path,
        (width, height): (u32, u32),
    ) -> PipelineResult<(String, Classification, String)> {
        let t = Instant::now();
        let oriented = decode_oriented(bytes).map_err(|e| PipelineError::DecodeFailed {
            filename: filename.to_string(),
            source: e,
        })?;
        let gray = to_grayscale(&oriented.resize_exact(
            width,
            height,
            image::imageops::FilterType::Lanczos3,
        ));
        self.metrics.record_stage_duration(Stage::Normalize, t.elapsed());

        let t = Instant::now();
        std::fs::create_dir_all(out_dir).map_err(|e| PipelineError::PersistFailed {
            path: out_dir.display().to_string(),
            source: image::ImageError::IoError(e),
        })?;
        let output_name = PersistPipeline::output_name(filename, false);
        self.persist
            .execute(WorkingImage::Gray(gray.clone()), &output_name, out_dir)?;
        self.metrics.record_stage_duration(Stage::Persist, t.elapsed());

        let t = Instant::now();
        let classification = self.classify.execute(&gray, filename)?;
        self.metrics.record_stage_duration(Stage::Classify, t.elapsed());
        self.metrics.record_verdict(classification.verdict);

        let preview = encode_png(&image::DynamicImage::ImageLuma8(gray))
            .map(|png| to_data_url(&png))
            .map_err(|e| PipelineError::ImageFailed {
                filename: filename.to_string(),
                reason: format!("{:#}", e),
            })?;

        Ok((output_name, classification, preview))
    }

    /// Run every file of a job in parallel, keeping input order
    fn run_images(
        &self,
        images: &[ImageData],
        out_dir: &Path,
        job_id: &str,
        options: JobOptions,
    ) -> (Vec<FileResult>, PerformanceMetrics) {
        let output_names = plan_output_names(images, options);

        let outcomes: Vec<(FileResult, PerformanceMetrics)> = images
            .par_iter()
            .zip(output_names.par_iter())
            .map(|(image, output_name)| self.run_file(image, output_name, out_dir, job_id, options))
            .collect();

        let mut perf = PerformanceMetrics::default();
        let mut results = Vec::with_capacity(outcomes.len());
        for (result, file_perf) in outcomes {
            perf.merge(&file_perf);
            results.push(result);
        }
        (results, perf)
    }

    /// Run phases 1-4 on one file; failures stay local to the file
    fn run_file(
        &self,
        image: &ImageData,
        output_name: &str,
        out_dir: &Path,
        job_id: &str,
        options: JobOptions,
    ) -> (FileResult, PerformanceMetrics) {
        let start = Instant::now();
        let mut perf = PerformanceMetrics::default();

        match self.try_run_file(image, output_name, out_dir, options, &mut perf) {
            Ok((augmentation, classification)) => {
                let elapsed = start.elapsed();
                debug!(
                    "{} processed in {:.2}ms",
                    image.filename,
                    elapsed.as_secs_f64() * 1000.0
                );
                self.metrics.record_file(true);
                let result = FileResult {
                    index: image.index,
                    filename: image.filename.clone(),
                    success: true,
                    processing_time_ms: elapsed.as_secs_f64() * 1000.0,
                    output_name: Some(output_name.to_string()),
                    output_url: Some(output_url(job_id, output_name)),
                    augmentation,
                    classification,
                    error: None,
                };
                (result, perf)
            }
            Err(e) => {
                warn!("Failed to process {}: {}", image.filename, e);
                self.metrics.record_file(false);
                (FileResult::failed(image, e.to_string(), start.elapsed()), perf)
            }
        }
    }

    fn try_run_file(
        &self,
        image: &ImageData,
        output_name: &str,
        out_dir: &Path,
        options: JobOptions,
        perf: &mut PerformanceMetrics,
    ) -> PipelineResult<(Option<AugmentationRecord>, Option<Classification>)> {
        if options.cutout {
            self.run_cutout(image, output_name, out_dir, perf)?;
            return Ok((None, None));
        }

        // Phase 1
        let t = Instant::now();
        let Phase1Output { working, gray } = self.normalize.execute(image, options.remove_background)?;
        perf.normalize_time = t.elapsed();
        self.metrics.record_stage_duration(Stage::Normalize, perf.normalize_time);
        if options.remove_background {
            perf.background_removals += 1;
            self.metrics.record_background_removal();
        }

        // Phase 2
        let (working, augmentation) = if options.augment {
            let t = Instant::now();
            let mut rng = AugmentPipeline::rng_for(options.seed, image.index);
            let (augmented, record) = self.augment.execute(working, &image.filename, &mut rng);
            perf.augment_time = t.elapsed();
            perf.record_augmentation(&record);
            self.metrics.record_stage_duration(Stage::Augment, perf.augment_time);
            self.metrics.record_augmentation(&record);
            (augmented, Some(record))
        } else {
            (working, None)
        };

        // Phase 3
        let t = Instant::now();
        self.persist.execute(working, output_name, out_dir)?;
        perf.persist_time = t.elapsed();
        self.metrics.record_stage_duration(Stage::Persist, perf.persist_time);

        // Phase 4
        let classification = if options.classify {
            let t = Instant::now();
            let classification = self.classify.execute(&gray, &image.filename)?;
            perf.classify_time = t.elapsed();
            perf.classifications += 1;
            self.metrics.record_stage_duration(Stage::Classify, perf.classify_time);
            self.metrics.record_verdict(classification.verdict);
            Some(classification)
        } else {
            None
        };

        Ok((augmentation, classification))
    }

    /// Colour cutout at the source resolution, no grayscale or resize
    fn run_cutout(
        &self,
        image: &ImageData,
        output_name: &str,
        out_dir: &Path,
        perf: &mut PerformanceMetrics,
    ) -> PipelineResult<()> {
        let t = Instant::now();
        let rgba = self.normalize.cutout(image)?;
        perf.normalize_time = t.elapsed();
        perf.background_removals += 1;
        self.metrics.record_stage_duration(Stage::Normalize, perf.normalize_time);
        self.metrics.record_background_removal();

        let t = Instant::now();
        self.persist.save_cutout(rgba, output_name, out_dir)?;
        perf.persist_time = t.elapsed();
        self.metrics.record_stage_duration(Stage::Persist, perf.persist_time);
        Ok(())
    }
}

/// Load a model, or log why it is unavailable
fn load_optional<T>(name: &str, load: impl FnOnce() -> anyhow::Result<T>) -> Option<Arc<T>> {
    match load() {
        Ok(service) => Some(Arc::new(service)),
        Err(e) => {
            warn!("{} unavailable: {:#}", name, e);
            None
        }
    }
}

fn summarize(
    job_id: String,
    results: Vec<FileResult>,
    perf: PerformanceMetrics,
    elapsed: Duration,
) -> BatchResult {
    let total = results.len();
    let successful = results.iter().filter(|r| r.success).count();
    let processing_time_ms = elapsed.as_secs_f64() * 1000.0;

    info!(
        "Job {} complete: {}/{} successful in {:.2}ms",
        job_id, successful, total, processing_time_ms
    );

    BatchResult {
        job_id,
        total,
        successful,
        failed: total - successful,
        processing_time_ms,
        average_time_per_file_ms: if total > 0 {
            processing_time_ms / total as f64
        } else {
            0.0
        },
        analytics: perf.into_analytics(total, elapsed),
        results,
    }
}

fn collect_images(paths: Vec<PathBuf>) -> Vec<ImageData> {
    paths
        .into_iter()
        .enumerate()
        .map(|(index, path)| ImageData {
            index,
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            path,
        })
        .collect()
}

/// Output names for a job, de-duplicated with a numeric suffix
fn plan_output_names(images: &[ImageData], options: JobOptions) -> Vec<String> {
    let mut seen = HashSet::new();
    images
        .iter()
        .map(|image| {
            let name = if options.cutout {
                PersistPipeline::cutout_name(&image.filename)
            } else {
                PersistPipeline::output_name(&image.filename, options.remove_background)
            };
            if seen.insert(name.clone()) {
                return name;
            }

            let path = Path::new(&name);
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("processed");
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("png");
            let mut n = 1;
            loop {
                let candidate = format!("{}_{}.{}", stem, n, ext);
                if seen.insert(candidate.clone()) {
                    break candidate;
                }
                n += 1;
            }
        })
        .collect()
}

fn output_url(job_id: &str, output_name: &str) -> String {
    format!("/processed/{}/{}", job_id, output_name)
}
