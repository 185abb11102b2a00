use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::{AugmentationRecord, Verdict};

/// Pipeline stage, used to key duration histories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Normalize,
    Augment,
    Persist,
    Classify,
}

/// Durations kept per stage for avg/p95
const STAGE_WINDOW: usize = 1000;

/// Recent durations of one stage plus the all-time count
#[derive(Default)]
struct StageHistory {
    recent: VecDeque<u64>,
    count: usize,
}

impl StageHistory {
    fn push(&mut self, value: u64) {
        if self.recent.len() == STAGE_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
        self.count += 1;
    }
}

/// Global metrics collector for the application.
///
/// Thread-safe and cheap to clone; shared between the HTTP handlers and the
/// orchestrator.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Upload metrics
    uploads_received: AtomicUsize,
    files_processed: AtomicUsize,
    files_failed: AtomicUsize,

    // Augmentation metrics
    rotations: AtomicUsize,
    scalings: AtomicUsize,
    blurs: AtomicUsize,

    // Model metrics
    background_removals: AtomicUsize,
    verdict_tower: AtomicUsize,
    verdict_skytree: AtomicUsize,
    verdict_none: AtomicUsize,

    // Stage durations
    normalize_duration_ms: RwLock<StageHistory>,
    augment_duration_ms: RwLock<StageHistory>,
    persist_duration_ms: RwLock<StageHistory>,
    classify_duration_ms: RwLock<StageHistory>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                uploads_received: AtomicUsize::new(0),
                files_processed: AtomicUsize::new(0),
                files_failed: AtomicUsize::new(0),
                rotations: AtomicUsize::new(0),
                scalings: AtomicUsize::new(0),
                blurs: AtomicUsize::new(0),
                background_removals: AtomicUsize::new(0),
                verdict_tower: AtomicUsize::new(0),
                verdict_skytree: AtomicUsize::new(0),
                verdict_none: AtomicUsize::new(0),
                normalize_duration_ms: RwLock::new(StageHistory::default()),
                augment_duration_ms: RwLock::new(StageHistory::default()),
                persist_duration_ms: RwLock::new(StageHistory::default()),
                classify_duration_ms: RwLock::new(StageHistory::default()),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_upload(&self) {
        self.inner.uploads_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file(&self, success: bool) {
        if success {
            self.inner.files_processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.files_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_augmentation(&self, record: &AugmentationRecord) {
        if record.rotation_degrees.is_some() {
            self.inner.rotations.fetch_add(1, Ordering::Relaxed);
        }
        if record.scale_factor.is_some() {
            self.inner.scalings.fetch_add(1, Ordering::Relaxed);
        }
        if record.blur_radius.is_some() {
            self.inner.blurs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_background_removal(&self) {
        self.inner.background_removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_verdict(&self, verdict: Verdict) {
        let counter = match verdict {
            Verdict::Tower => &self.inner.verdict_tower,
            Verdict::Skytree => &self.inner.verdict_skytree,
            Verdict::None => &self.inner.verdict_none,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_duration(&self, stage: Stage, duration: Duration) {
        let history = match stage {
            Stage::Normalize => &self.inner.normalize_duration_ms,
            Stage::Augment => &self.inner.augment_duration_ms,
            Stage::Persist => &self.inner.persist_duration_ms,
            Stage::Classify => &self.inner.classify_duration_ms,
        };
        history.write().push(duration.as_millis() as u64);
    }

    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stage = |history: &RwLock<StageHistory>| {
            let history = history.read();
            let values: Vec<u64> = history.recent.iter().copied().collect();
            StageSnapshot {
                count: history.count,
                avg_ms: avg(&values),
                p95_ms: percentile(&values, 0.95),
            }
        };

        let endpoint_requests = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            uploads_received: self.inner.uploads_received.load(Ordering::Relaxed),
            files_processed: self.inner.files_processed.load(Ordering::Relaxed),
            files_failed: self.inner.files_failed.load(Ordering::Relaxed),
            rotations: self.inner.rotations.load(Ordering::Relaxed),
            scalings: self.inner.scalings.load(Ordering::Relaxed),
            blurs: self.inner.blurs.load(Ordering::Relaxed),
            background_removals: self.inner.background_removals.load(Ordering::Relaxed),
            verdict_tower: self.inner.verdict_tower.load(Ordering::Relaxed),
            verdict_skytree: self.inner.verdict_skytree.load(Ordering::Relaxed),
            verdict_none: self.inner.verdict_none.load(Ordering::Relaxed),
            normalize: stage(&self.inner.normalize_duration_ms),
            augment: stage(&self.inner.augment_duration_ms),
            persist: stage(&self.inner.persist_duration_ms),
            classify: stage(&self.inner.classify_duration_ms),
            endpoint_requests,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            r#"# HELP uploads_received_total Total number of uploads received
# TYPE uploads_received_total counter
uploads_received_total {{}} {}

# HELP files_processed_total Files that completed the pipeline
# TYPE files_processed_total counter
files_processed_total {{}} {}

# HELP files_failed_total Files that failed in any stage
# TYPE files_failed_total counter
files_failed_total {{}} {}

# HELP augmentations_total Random transforms applied
# TYPE augmentations_total counter
augmentations_total {{kind="rotate"}} {}
augmentations_total {{kind="scale"}} {}
augmentations_total {{kind="blur"}} {}

# HELP background_removals_total Images with background removed
# TYPE background_removals_total counter
background_removals_total {{}} {}

# HELP classifications_total Classifier verdicts
# TYPE classifications_total counter
classifications_total {{verdict="tower"}} {}
classifications_total {{verdict="skytree"}} {}
classifications_total {{verdict="none"}} {}

# HELP stage_avg_duration_ms Average stage duration in milliseconds
# TYPE stage_avg_duration_ms gauge
stage_avg_duration_ms {{stage="normalize"}} {}
stage_avg_duration_ms {{stage="augment"}} {}
stage_avg_duration_ms {{stage="persist"}} {}
stage_avg_duration_ms {{stage="classify"}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            s.uploads_received,
            s.files_processed,
            s.files_failed,
            s.rotations,
            s.scalings,
            s.blurs,
            s.background_removals,
            s.verdict_tower,
            s.verdict_skytree,
            s.verdict_none,
            s.normalize.avg_ms,
            s.augment.avg_ms,
            s.persist.avg_ms,
            s.classify.avg_ms,
            s.uptime_seconds,
        );

        if !s.endpoint_requests.is_empty() {
            out.push_str("\n# HELP endpoint_requests_total Requests per endpoint\n");
            out.push_str("# TYPE endpoint_requests_total counter\n");
            for (endpoint, count) in &s.endpoint_requests {
                out.push_str(&format!(
                    "endpoint_requests_total {{endpoint=\"{}\"}} {}\n",
                    endpoint, count
                ));
            }
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub count: usize,
    pub avg_ms: u64,
    pub p95_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uploads_received: usize,
    pub files_processed: usize,
    pub files_failed: usize,
    pub rotations: usize,
    pub scalings: usize,
    pub blurs: usize,
    pub background_removals: usize,
    pub verdict_tower: usize,
    pub verdict_skytree: usize,
    pub verdict_none: usize,
    pub normalize: StageSnapshot,
    pub augment: StageSnapshot,
    pub persist: StageSnapshot,
    pub classify: StageSnapshot,
    pub endpoint_requests: BTreeMap<String, usize>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_upload();
        metrics.record_file(true);
        metrics.record_file(true);
        metrics.record_file(false);
        metrics.record_augmentation(&AugmentationRecord {
            rotation_degrees: Some(90.0),
            scale_factor: Some(1.1),
            blur_radius: None,
        });
        metrics.record_verdict(Verdict::Skytree);
        metrics.record_stage_duration(Stage::Normalize, Duration::from_millis(10));
        metrics.record_stage_duration(Stage::Normalize, Duration::from_millis(30));
        metrics.record_endpoint_request("/upload");
        metrics.record_endpoint_request("/upload");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.uploads_received, 1);
        assert_eq!(snapshot.files_processed, 2);
        assert_eq!(snapshot.files_failed, 1);
        assert_eq!(snapshot.rotations, 1);
        assert_eq!(snapshot.scalings, 1);
        assert_eq!(snapshot.blurs, 0);
        assert_eq!(snapshot.verdict_skytree, 1);
        assert_eq!(snapshot.normalize.count, 2);
        assert_eq!(snapshot.normalize.avg_ms, 20);
        assert_eq!(snapshot.endpoint_requests.get("/upload"), Some(&2));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_upload();
        metrics.record_verdict(Verdict::Tower);
        metrics.record_endpoint_request("/predict");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("uploads_received_total {} 1"));
        assert!(prometheus.contains("classifications_total {verdict=\"tower\"} 1"));
        assert!(prometheus.contains("endpoint_requests_total {endpoint=\"/predict\"} 1"));
    }

    #[test]
    fn test_stage_history_is_windowed() {
        let metrics = Metrics::new();
        for _ in 0..STAGE_WINDOW {
            metrics.record_stage_duration(Stage::Persist, Duration::from_millis(1000));
        }
        for _ in 0..STAGE_WINDOW {
            metrics.record_stage_duration(Stage::Persist, Duration::from_millis(2));
        }

        assert_eq!(metrics.inner.persist_duration_ms.read().recent.len(), STAGE_WINDOW);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.persist.count, 2 * STAGE_WINDOW);
        assert_eq!(snapshot.persist.avg_ms, 2);
        assert_eq!(snapshot.persist.p95_ms, 2);
    }

    #[test]
    fn test_percentile_empty_and_single() {
        assert_eq!(percentile(&[], 0.95), 0);
        assert_eq!(percentile(&[7], 0.95), 7);
        assert_eq!(percentile(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 0.5), 5);
    }
}
