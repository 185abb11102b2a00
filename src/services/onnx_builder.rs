// Shared ONNX Runtime session construction and pooling
//
// Both models (background segmentation, landmark classifier) go through here
// so they get the same execution-provider ladder and the same pool semantics.

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

/// Execution backend a session ended up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    TensorRT,
    Cuda,
    CoreML,
    DirectML,
    OpenVINO,
    Cpu,
}

impl Backend {
    /// Preference order for automatic selection
    const LADDER: [Backend; 6] = [
        Backend::TensorRT,
        Backend::Cuda,
        Backend::CoreML,
        Backend::DirectML,
        Backend::OpenVINO,
        Backend::Cpu,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Backend::TensorRT => "TensorRT",
            Backend::Cuda => "CUDA",
            Backend::CoreML => "CoreML",
            Backend::DirectML => "DirectML",
            Backend::OpenVINO => "OpenVINO-CPU",
            Backend::Cpu => "CPU",
        }
    }

    /// Lowercase key accepted by `INFERENCE_BACKEND`
    pub fn key(&self) -> &'static str {
        match self {
            Backend::TensorRT => "tensorrt",
            Backend::Cuda => "cuda",
            Backend::CoreML => "coreml",
            Backend::DirectML => "directml",
            Backend::OpenVINO => "openvino",
            Backend::Cpu => "cpu",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "tensorrt" => Some(Backend::TensorRT),
            "cuda" => Some(Backend::Cuda),
            "coreml" => Some(Backend::CoreML),
            "directml" => Some(Backend::DirectML),
            "openvino" => Some(Backend::OpenVINO),
            "cpu" => Some(Backend::Cpu),
            _ => None,
        }
    }

    /// Provider for this backend, or None when it wasn't compiled in
    fn dispatch(self) -> Option<ExecutionProviderDispatch> {
        match self {
            #[cfg(feature = "tensorrt")]
            Backend::TensorRT => Some(TensorRTExecutionProvider::default().build()),
            #[cfg(feature = "cuda")]
            Backend::Cuda => Some(CUDAExecutionProvider::default().build()),
            #[cfg(all(target_os = "macos", feature = "coreml"))]
            Backend::CoreML => Some(CoreMLExecutionProvider::default().build()),
            #[cfg(all(target_os = "windows", feature = "directml"))]
            Backend::DirectML => Some(DirectMLExecutionProvider::default().build()),
            #[cfg(feature = "openvino")]
            Backend::OpenVINO => Some(
                OpenVINOExecutionProvider::default()
                    .with_device_type("CPU")
                    .build(),
            ),
            Backend::Cpu => Some(CPUExecutionProvider::default().build()),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

/// Intra-op threads per session so that a full pool doesn't oversubscribe the CPU.
fn intra_op_threads(pool_size: usize) -> usize {
    let total_cores = num_cpus::get();
    let per_session = (total_cores / pool_size.max(1)).max(1);
    debug!(
        "CPU threads: {} total cores, {} per session ({} sessions)",
        total_cores, per_session, pool_size
    );
    per_session
}

fn try_build(
    backend: Backend,
    model_bytes: &[u8],
    threads: usize,
) -> Option<ort::Result<Session>> {
    let provider = backend.dispatch()?;

    let built = Session::builder().and_then(|b| {
        let b = b.with_execution_providers([provider])?;
        // DirectML needs sequential execution and no memory pattern
        let b = if backend == Backend::DirectML {
            b.with_parallel_execution(false)?
                .with_memory_pattern(false)?
                .with_optimization_level(GraphOptimizationLevel::Level1)?
        } else {
            b.with_optimization_level(GraphOptimizationLevel::Level3)?
        };
        b.with_intra_threads(threads)?
            .with_inter_threads(1)?
            .commit_from_memory(model_bytes)
    });
    Some(built)
}

/// Build a session, trying compiled-in accelerators before falling back to CPU.
///
/// `forced` pins one backend (e.g. "cpu", "cuda"); unknown names fall back to
/// automatic selection.
pub fn build_session(
    model_bytes: &[u8],
    model_name: &str,
    forced: Option<&str>,
    pool_size: usize,
) -> Result<(Backend, Session)> {
    let threads = intra_op_threads(pool_size);

    if let Some(name) = forced {
        match Backend::parse(name) {
            Some(backend) => {
                info!("INFERENCE_BACKEND={}, forcing {} for {}", name, backend.name(), model_name);
                let session = try_build(backend, model_bytes, threads)
                    .with_context(|| {
                        format!("{} backend was not compiled into this build", backend.name())
                    })?
                    .with_context(|| {
                        format!("Failed to load {} model with {}", model_name, backend.name())
                    })?;
                return Ok((backend, session));
            }
            None => warn!(
                "Unknown backend '{}', falling back to auto-detection for {}",
                name, model_name
            ),
        }
    }

    for backend in Backend::LADDER {
        match try_build(backend, model_bytes, threads) {
            None => continue,
            Some(Ok(session)) => {
                if backend == Backend::Cpu {
                    warn!("Using CPU-only inference for {} (no GPU acceleration available)", model_name);
                } else {
                    info!("✓ Using {} acceleration for {}", backend.name(), model_name);
                }
                return Ok((backend, session));
            }
            Some(Err(e)) if backend == Backend::Cpu => {
                return Err(anyhow::Error::new(e).context(format!(
                    "Failed to load {} ONNX model ({:.1} MB). Check that the file is a \
                    valid ONNX export and matches the ONNX Runtime opset",
                    model_name,
                    model_bytes.len() as f64 / 1_048_576.0
                )));
            }
            Some(Err(e)) => debug!("{} unavailable for {}: {}", backend.name(), model_name, e),
        }
    }

    anyhow::bail!("No execution provider could load the {} model", model_name)
}

/// Read a model file, rejecting Git LFS pointer stubs.
pub fn load_model_bytes(path: &Path, model_name: &str) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read {} model from {}", model_name, path.display()))?;

    if bytes.len() < 100 {
        anyhow::bail!(
            "{} model at {} is only {} bytes. This might be a Git LFS stub",
            model_name,
            path.display(),
            bytes.len()
        );
    }

    info!("Loaded {} model ({:.1} MB)", model_name, bytes.len() as f64 / 1_048_576.0);
    Ok(bytes)
}

/// Fixed-size pool of sessions for one model.
///
/// Backed by a bounded crossbeam channel; `acquire` blocks until a session is
/// free and the returned guard puts it back on drop.
pub struct SessionPool {
    sender: Sender<Session>,
    receiver: Receiver<Session>,
    backend: Backend,
}

impl SessionPool {
    pub fn build(
        model_bytes: &[u8],
        model_name: &str,
        size: usize,
        forced: Option<&str>,
    ) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = bounded(size);

        let (backend, first) = build_session(model_bytes, model_name, forced, size)?;
        sender.send(first).context("Session pool closed")?;

        // Remaining sessions pinned to the backend the first one landed on
        for _ in 1..size {
            let (_, session) = build_session(model_bytes, model_name, Some(backend.key()), size)?;
            sender.send(session).context("Session pool closed")?;
        }

        info!("✓ {}: {} sessions on {}", model_name, size, backend.name());
        Ok(Self {
            sender,
            receiver,
            backend,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Acquire a session, blocking while all are in use
    pub fn acquire(&self) -> Result<PooledSession<'_>> {
        let session = self.receiver.recv().context("Session pool exhausted")?;
        Ok(PooledSession {
            session: Some(session),
            pool: self,
        })
    }
}

/// A session borrowed from a [`SessionPool`]
pub struct PooledSession<'a> {
    session: Option<Session>,
    pool: &'a SessionPool,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session present until drop")
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.pool.sender.send(session).is_err() {
                warn!("Session pool closed; dropping session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse_round_trip() {
        for backend in Backend::LADDER {
            assert_eq!(Backend::parse(backend.key()), Some(backend));
        }
        assert_eq!(Backend::parse(" CPU "), Some(Backend::Cpu));
        assert_eq!(Backend::parse("auto"), None);
    }

    #[test]
    fn test_intra_op_threads_never_zero() {
        assert!(intra_op_threads(1) >= 1);
        assert!(intra_op_threads(10_000) >= 1);
        assert!(intra_op_threads(0) >= 1);
    }

    #[test]
    fn test_load_model_rejects_stub() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stub.onnx");
        std::fs::write(&path, b"version https://git-lfs.github.com/spec/v1").unwrap();
        assert!(load_model_bytes(&path, "test").is_err());
        assert!(load_model_bytes(&dir.path().join("missing.onnx"), "test").is_err());
    }
}
