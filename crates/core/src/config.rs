use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleConfig;
use crate::seed::Seed;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VFILAB_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LabConfig {
    pub paths: PathsConfig,
    pub training: TrainingConfig,
    pub schedule: ScheduleConfig,
    pub evaluation: EvaluationConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Dataset root holding the train and validation split directories.
    pub dataset_root: PathBuf,
    pub train_split: String,
    pub val_split: String,
    /// Directory of frame triplets scored by `benchmark`.
    pub benchmark_root: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub summary_dir: PathBuf,
    /// Root under which validation predictions are written, one directory per sample.
    pub output_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: u32,
    pub batch_size: usize,
    pub seed: Seed,
    pub eval_every_epochs: u32,
    pub scalar_every_steps: u64,
    pub progress_every_batches: usize,
    pub prefetch_batches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Side-by-side comparisons emitted from the first validation batch.
    pub visual_samples: usize,
    /// Flow visualizations emitted from the first validation batch.
    pub flow_samples: usize,
    pub dump: ImageDumpConfig,
}

/// How often validation predictions are written to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImageDumpConfig {
    /// Dump on every n-th evaluation pass; 0 disables dumping.
    pub every_n_evals: u32,
    /// Cap on frames written per pass; `None` writes every sample.
    pub max_samples: Option<usize>,
    pub file_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Blend,
    Onnx,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub kind: ModelKind,
    /// ONNX execution backend: `cuda`, `tensorrt` or `cpu`.
    pub backend: String,
    pub trt_cache_dir: PathBuf,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            training: TrainingConfig::default(),
            schedule: ScheduleConfig::default(),
            evaluation: EvaluationConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            dataset_root: PathBuf::from("datasets/atd12k_points"),
            train_split: "train_10k".to_string(),
            val_split: "test_2k_540p".to_string(),
            benchmark_root: PathBuf::from("datasets/atd12k_points/test_2k_540p"),
            checkpoint_dir: PathBuf::from("train_log"),
            summary_dir: PathBuf::from("summaries"),
            output_root: PathBuf::from("outputs/interp"),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 16,
            seed: Seed::default(),
            eval_every_epochs: 5,
            scalar_every_steps: 200,
            progress_every_batches: 100,
            prefetch_batches: 2,
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            visual_samples: 10,
            flow_samples: 2,
            dump: ImageDumpConfig::default(),
        }
    }
}

impl Default for ImageDumpConfig {
    fn default() -> Self {
        Self {
            every_n_evals: 1,
            max_samples: None,
            file_name: "interp.png".to_string(),
        }
    }
}

impl ImageDumpConfig {
    /// Whether pass number `eval_index` (1-based) writes predictions.
    pub fn dumps_on(&self, eval_index: u32) -> bool {
        self.every_n_evals != 0 && eval_index % self.every_n_evals == 0
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::Blend,
            backend: "cuda".to_string(),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl LabConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Anchor every relative path in `paths` at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let paths = &mut self.paths;
        for path in [
            &mut paths.dataset_root,
            &mut paths.benchmark_root,
            &mut paths.checkpoint_dir,
            &mut paths.summary_dir,
            &mut paths.output_root,
        ] {
            *path = resolve_relative_to(base, path);
        }
        self.model.trt_cache_dir = resolve_relative_to(base, &self.model.trt_cache_dir);
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VFILAB_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir if missing
/// - Writes default config.toml only if file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        LabConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
