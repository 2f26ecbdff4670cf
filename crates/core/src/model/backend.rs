//! ONNX Runtime session construction for the interpolation models.

use std::fmt;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProviderDispatch, TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{info, warn};

const DEFAULT_TRT_CACHE_DIR: &str = "trt_cache";

/// Execution provider requested in `[model] backend`.
///
/// `Tensorrt` registers CUDA behind it, so a machine without the TensorRT
/// libraries still runs on the GPU. Unknown names select `Cuda`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    pub fn from_str_lossy(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cuda => "cuda",
            Self::Tensorrt => "tensorrt",
            Self::Cpu => "cpu",
        })
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: &'a InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Providers in priority order; empty means the default CPU provider.
fn execution_providers(
    backend: InferenceBackend,
    trt_cache_dir: Option<&Path>,
) -> Vec<ExecutionProviderDispatch> {
    match backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = trt_cache_dir.unwrap_or_else(|| Path::new(DEFAULT_TRT_CACHE_DIR));
            if let Err(error) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    %error,
                    "TensorRT engine cache directory unavailable"
                );
            }
            let cache_path = cache_dir.to_string_lossy().to_string();
            vec![
                TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .with_engine_cache_path(&cache_path)
                    .with_fp16(true)
                    .build(),
                CUDAExecutionProvider::default().build(),
            ]
        }
        InferenceBackend::Cuda => vec![CUDAExecutionProvider::default().build()],
        InferenceBackend::Cpu => Vec::new(),
    }
}

/// Load `config.model_path` into a session on the requested backend.
///
/// The first TensorRT load compiles engines into the cache directory and can
/// take minutes; later loads reuse them.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let providers = execution_providers(*config.backend, config.trt_cache_dir);
    let started = Instant::now();
    info!(
        backend = %config.backend,
        model = %config.model_path.display(),
        "Building ONNX Runtime session"
    );

    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    if !providers.is_empty() {
        builder = builder.with_execution_providers(providers)?;
    }
    let session = builder
        .commit_from_file(config.model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()))?;

    info!(
        backend = %config.backend,
        elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
        "ONNX Runtime session ready"
    );
    Ok(session)
}
