use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vfilab_core::benchmark::{run_benchmark, write_report};
use vfilab_core::config::{config_path, data_dir, initialize_data_dir, LabConfig, ModelKind};
use vfilab_core::dataset::{LoaderOptions, TripletDataset, TripletLoader};
use vfilab_core::logging::{self, LogSettings, RuntimeLogMode, DEFAULT_LOG_FILTER};
use vfilab_core::model::build_model;
use vfilab_core::seed::{RngStream, Seed, SeedStreams};
use vfilab_core::summary::{DisabledSummaryWriter, EventLogWriter, SummaryWriter};
use vfilab_core::train::{Summaries, Trainer, TrainerSettings};
use vfilab_core::types::ProcessRole;

const ENV_WORLD_SIZE: &str = "WORLD_SIZE";

#[derive(Parser)]
#[command(
    name = "vfilab",
    about = "Train and benchmark video frame interpolation models"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Distillation training with periodic validation and checkpointing.
    Train(TrainArgs),
    /// Score a checkpoint on a directory of frame triplets.
    Benchmark(BenchmarkArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelArg {
    Blend,
    Onnx,
}

impl From<ModelArg> for ModelKind {
    fn from(value: ModelArg) -> Self {
        match value {
            ModelArg::Blend => ModelKind::Blend,
            ModelArg::Onnx => ModelKind::Onnx,
        }
    }
}

#[derive(Args)]
struct TrainArgs {
    #[arg(long = "epoch", help = "Number of training epochs")]
    epochs: Option<u32>,
    #[arg(long = "batch_size", alias = "batch-size", help = "Samples per batch")]
    batch_size: Option<usize>,
    #[arg(long = "local_rank", alias = "local-rank", default_value_t = 0)]
    local_rank: usize,
    #[arg(long = "train", value_name = "DIR", help = "Dataset root holding the split directories")]
    dataset_root: Option<PathBuf>,
    #[arg(long, value_name = "FILE", help = "Config file (defaults to <data-dir>/config.toml)")]
    config: Option<PathBuf>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    model: Option<ModelArg>,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct BenchmarkArgs {
    #[arg(long, value_name = "DIR", help = "Directory of frame triplets")]
    root: Option<PathBuf>,
    #[arg(long, value_name = "FILE", help = "Config file (defaults to <data-dir>/config.toml)")]
    config: Option<PathBuf>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    model: Option<ModelArg>,
    #[arg(long, value_name = "FILE", help = "Write a JSON report with per-case scores")]
    report: Option<PathBuf>,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Commands::Train(_) => RuntimeLogMode::Train,
        Commands::Benchmark(_) => RuntimeLogMode::Benchmark,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let log_settings = LogSettings {
        verbose: cli.verbose,
        cli_filter: cli.log_filter.clone(),
        env_filter: std::env::var("RUST_LOG").ok(),
    };
    init_logging(mode, &resolved_data_dir, &log_settings);
    log_startup_metadata(mode, Some(resolved_data_dir.as_path()));

    match cli.command {
        Commands::Train(args) => run_train(args, &resolved_data_dir),
        Commands::Benchmark(args) => run_benchmark_command(args, &resolved_data_dir),
    }
}

/// Read the config file and anchor its relative paths at the file's directory.
fn load_config(data_dir: &Path, explicit: Option<&Path>) -> Result<LabConfig> {
    initialize_data_dir(data_dir)?;
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_path(data_dir));
    let mut config = LabConfig::load_from_path(&path)?;
    let base = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(data_dir);
    config.resolve_paths(base);
    info!(config = %path.display(), "Configuration loaded");
    Ok(config)
}

fn world_size_from_env() -> Result<usize> {
    match std::env::var(ENV_WORLD_SIZE) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {ENV_WORLD_SIZE} value: '{raw}'")),
        Err(_) => Ok(1),
    }
}

fn apply_train_overrides(config: &mut LabConfig, args: &TrainArgs) {
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(root) = &args.dataset_root {
        config.paths.dataset_root = root.clone();
    }
    if let Some(dir) = &args.checkpoint_dir {
        config.paths.checkpoint_dir = dir.clone();
    }
    if let Some(model) = args.model {
        config.model.kind = model.into();
    }
    if let Some(seed) = args.seed {
        config.training.seed = Seed(seed);
    }
}

fn summary_writer(enabled: bool, run_dir: PathBuf) -> Result<Box<dyn SummaryWriter>> {
    if enabled {
        Ok(Box::new(EventLogWriter::create(&run_dir)?))
    } else {
        Ok(Box::new(DisabledSummaryWriter))
    }
}

fn run_train(args: TrainArgs, data_dir: &Path) -> Result<()> {
    let mut config = load_config(data_dir, args.config.as_deref())?;
    apply_train_overrides(&mut config, &args);

    let role = ProcessRole::from_rank(args.local_rank);
    let world_size = world_size_from_env()?;
    let streams = SeedStreams::new(config.training.seed);

    let train_set = Arc::new(TripletDataset::open(
        &config.paths.dataset_root.join(&config.paths.train_split),
    )?);
    let val_set = Arc::new(TripletDataset::open(
        &config.paths.dataset_root.join(&config.paths.val_split),
    )?);
    info!(
        train = train_set.len(),
        validate = val_set.len(),
        world_size,
        rank = role.rank,
        "Datasets opened"
    );

    let prefetch = config.training.prefetch_batches;
    let mut train_loader = TripletLoader::new(
        train_set,
        LoaderOptions {
            batch_size: config.training.batch_size,
            shuffle: true,
            prefetch,
            rank: role.rank,
            world_size,
        },
        streams.rng(RngStream::Shuffle),
    )?;
    let mut val_loader = TripletLoader::new(
        val_set,
        LoaderOptions {
            batch_size: config.training.batch_size,
            shuffle: false,
            prefetch,
            rank: role.rank,
            world_size,
        },
        streams.rng(RngStream::Loader),
    )?;

    let mut model = build_model(&config.model, &streams)?;
    let summary_dir = &config.paths.summary_dir;
    let mut train_writer = summary_writer(role.is_coordinator, summary_dir.join("train"))?;
    let mut validate_writer = summary_writer(role.is_coordinator, summary_dir.join("validate"))?;

    let mut trainer = Trainer::new(
        TrainerSettings::from_config(&config),
        role,
        model.as_mut(),
        &mut train_loader,
        &mut val_loader,
        Summaries {
            train: train_writer.as_mut(),
            validate: validate_writer.as_mut(),
        },
    );
    let outcome = trainer.run()?;
    info!(
        global_step = outcome.state.global_step,
        evaluations = outcome.evaluations.len(),
        checkpoint_dir = %config.paths.checkpoint_dir.display(),
        "Run complete"
    );
    Ok(())
}

fn run_benchmark_command(args: BenchmarkArgs, data_dir: &Path) -> Result<()> {
    let mut config = load_config(data_dir, args.config.as_deref())?;
    if let Some(dir) = args.checkpoint_dir {
        config.paths.checkpoint_dir = dir;
    }
    if let Some(model) = args.model {
        config.model.kind = model.into();
    }
    let root = args.root.unwrap_or_else(|| config.paths.benchmark_root.clone());

    let streams = SeedStreams::new(config.training.seed);
    let mut model = build_model(&config.model, &streams)?;
    model.load_model(&config.paths.checkpoint_dir)?;

    let report = run_benchmark(model.as_mut(), &root)?;
    println!(
        "Avg PSNR: {:.4} SSIM: {:.4} over {} cases",
        report.mean_psnr,
        report.mean_ssim,
        report.cases.len()
    );
    if let Some(path) = args.report {
        write_report(&report, &path)?;
    }
    Ok(())
}

fn init_logging(mode: RuntimeLogMode, data_dir: &Path, settings: &LogSettings) {
    let hook = logging::install_panic_hook(&logging::crash_dir(data_dir));
    let filters = settings.filters();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));
    let (file_layer, file_error) = match logging::rolling_appender(data_dir, mode) {
        Ok(appender) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            ),
            None,
        ),
        Err(error) => (None, Some(error)),
    };

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(error) = file_error {
        warn!(error = %format!("{error:#}"), "Log file unavailable; logging to console only");
    }
    if let Err(error) = hook {
        warn!(error = %format!("{error:#}"), "Panics will not be written to crash reports");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: Option<&Path>) {
    let pid = std::process::id();
    if let Some(data_dir) = data_dir {
        let cfg_path = config_path(data_dir);
        info!(
            mode = mode.as_str(),
            pid,
            data_dir = %data_dir.display(),
            config_path = %cfg_path.display(),
            "Runtime startup metadata"
        );
    } else {
        info!(mode = mode.as_str(), pid, "Runtime startup metadata");
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("valid command line")
    }

    #[test]
    fn train_flags_keep_their_legacy_spelling() {
        let cli = parse(&[
            "vfilab",
            "train",
            "--epoch",
            "3",
            "--batch_size",
            "4",
            "--local_rank",
            "1",
            "--train",
            "/data/atd",
            "--model",
            "onnx",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Train(args) = cli.command else {
            panic!("expected train command");
        };
        assert_eq!(args.epochs, Some(3));
        assert_eq!(args.batch_size, Some(4));
        assert_eq!(args.local_rank, 1);

        let mut config = LabConfig::default();
        apply_train_overrides(&mut config, &args);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.paths.dataset_root, PathBuf::from("/data/atd"));
        assert_eq!(config.model.kind, ModelKind::Onnx);
        assert_eq!(config.training.seed, Seed::default());
    }

    #[test]
    fn unset_overrides_leave_config_untouched() {
        let cli = parse(&["vfilab", "train"]);
        let Commands::Train(args) = cli.command else {
            panic!("expected train command");
        };
        let mut config = LabConfig::default();
        apply_train_overrides(&mut config, &args);
        assert_eq!(config, LabConfig::default());
    }

    #[test]
    fn benchmark_accepts_report_path() {
        let cli = parse(&[
            "vfilab",
            "--log-filter",
            "vfilab_core=trace",
            "benchmark",
            "--root",
            "bench",
            "--report",
            "out/report.json",
        ]);
        assert_eq!(cli.log_filter.as_deref(), Some("vfilab_core=trace"));
        let Commands::Benchmark(args) = cli.command else {
            panic!("expected benchmark command");
        };
        assert_eq!(args.root, Some(PathBuf::from("bench")));
        assert_eq!(args.report, Some(PathBuf::from("out/report.json")));
    }

    #[test]
    fn explicit_config_paths_resolve_next_to_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = dir.path().join("custom.toml");
        std::fs::write(&cfg, "[paths]\ncheckpoint_dir = \"ckpt\"\n").expect("write config");

        let config = load_config(&dir.path().join("data"), Some(&cfg)).expect("load config");
        assert_eq!(config.paths.checkpoint_dir, dir.path().join("ckpt"));
        assert!(dir.path().join("data").join("config.toml").exists());
    }
}

#[cfg(test)]
mod log_filter_tests {
    use super::*;

    #[test]
    fn cli_flags_reach_filter_selection() {
        let cli = Cli::try_parse_from(["vfilab", "-v", "benchmark"]).expect("parse");
        let settings = LogSettings {
            verbose: cli.verbose,
            cli_filter: cli.log_filter,
            env_filter: Some("warn".to_string()),
        };
        assert_eq!(settings.filters().console, "debug");

        let cli = Cli::try_parse_from(["vfilab", "--log-filter", "vfilab_core=trace", "train"])
            .expect("parse");
        let settings = LogSettings {
            verbose: cli.verbose,
            cli_filter: cli.log_filter,
            env_filter: None,
        };
        assert_eq!(settings.filters().file, "vfilab_core=trace");
    }

    #[test]
    fn invalid_filter_falls_back_to_default() {
        let filter = parse_env_filter_with_fallback("vfilab_core=loud", "console");
        assert_eq!(filter.to_string(), DEFAULT_LOG_FILTER);
    }
}
