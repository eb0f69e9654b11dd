//! Execution provider selection and `ort::Session` construction.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Execution provider used for every model session.
///
/// `Tensorrt` needs the TensorRT runtime (`libnvinfer.so.10` / `nvinfer.dll`);
/// when it is missing the session falls back to the CUDA provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Case-insensitive; unknown names select `Cuda`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    /// Root of the TensorRT engine cache; each model gets its own subdirectory.
    pub trt_cache_dir: Option<&'a Path>,
}

/// Engine cache directory for one model: `<root>/<model file stem>`.
pub fn model_cache_dir(root: &Path, model_path: &Path) -> PathBuf {
    match model_path.file_stem() {
        Some(stem) => root.join(stem),
        None => root.to_path_buf(),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct CacheStats {
    files: u64,
    bytes: u64,
}

impl CacheStats {
    fn scan(root: &Path) -> Self {
        let mut stats = Self::default();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if meta.is_file() {
                    stats.files += 1;
                    stats.bytes += meta.len();
                }
            }
        }
        stats
    }

    fn grew_since(&self, before: &Self) -> bool {
        self.files > before.files || self.bytes > before.bytes
    }
}

/// Periodic "still building" log while TensorRT compiles engines.
struct InitHeartbeat {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl InitHeartbeat {
    const TICK: Duration = Duration::from_secs(15);

    fn start(cache_dir: String) -> Self {
        let (stop, stopped) = channel::<()>();
        let handle = thread::spawn(move || {
            let started = Instant::now();
            while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(Self::TICK) {
                info!(
                    elapsed_secs = started.elapsed().as_secs(),
                    cache_dir = %cache_dir,
                    "TensorRT engine build still in progress"
                );
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for InitHeartbeat {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Build a session for `config.model_path` on the selected backend.
///
/// `Tensorrt` registers the TensorRT provider with an on-disk engine cache
/// followed by CUDA as fallback; `Cuda` registers CUDA only. ORT itself
/// falls back to CPU when no GPU provider can be registered.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    match config.backend {
        InferenceBackend::Tensorrt => build_tensorrt_session(builder, config),
        InferenceBackend::Cuda => build_cuda_session(builder, config),
    }
}

fn build_cuda_session(builder: SessionBuilder, config: &SessionConfig<'_>) -> Result<Session> {
    if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
        warn!("CUDA EP is not available, inference will fall back to CPU");
    }
    debug!(backend = "cuda", model = %config.model_path.display(), "Building session");

    builder
        .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])?
        .commit_from_file(config.model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()))
}

fn build_tensorrt_session(builder: SessionBuilder, config: &SessionConfig<'_>) -> Result<Session> {
    let root = config.trt_cache_dir.unwrap_or_else(|| Path::new("trt_cache"));
    let cache_dir = model_cache_dir(root, config.model_path);
    if let Err(e) = std::fs::create_dir_all(&cache_dir) {
        warn!(dir = %cache_dir.display(), error = %e, "Failed to create TRT cache directory");
    }

    let before = CacheStats::scan(&cache_dir);
    info!(
        model = %config.model_path.display(),
        cache_dir = %cache_dir.display(),
        cache_files = before.files,
        cache_bytes = before.bytes,
        "Initializing TensorRT session (first run may take several minutes)"
    );

    let started = Instant::now();
    let heartbeat = InitHeartbeat::start(cache_dir.display().to_string());
    let result = builder
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                .with_fp16(true)
                .with_device_id(0)
                .build(),
            CUDAExecutionProvider::default().build(),
        ])?
        .commit_from_file(config.model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()));
    drop(heartbeat);

    let elapsed_secs = started.elapsed().as_secs_f64();
    let after = CacheStats::scan(&cache_dir);
    match result {
        Ok(session) => {
            info!(
                elapsed_secs,
                cache_dir = %cache_dir.display(),
                cache_updated = after.grew_since(&before),
                cache_files = after.files,
                cache_bytes = after.bytes,
                "TensorRT session ready"
            );
            Ok(session)
        }
        Err(err) => {
            error!(
                elapsed_secs,
                cache_dir = %cache_dir.display(),
                error = %format!("{err:#}"),
                "TensorRT session initialization failed"
            );
            Err(err)
        }
    }
}
