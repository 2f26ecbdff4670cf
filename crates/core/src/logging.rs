//! Log filter selection, the rolling log file and panic crash reports.
//!
//! The subscriber itself is installed by the binary; this module decides what
//! it filters and where persistent output goes under the data directory:
//!
//! ```text
//! <data_dir>/logs/vfilab-<mode>.<date>.log
//! <data_dir>/logs/crash/panic-<timestamp>-<seq>.log
//! ```

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs;
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ONNX Runtime is chatty at `warn`; the console only shows its errors.
pub const CONSOLE_NOISE_FILTER: &str = "ort=error";
pub const FILE_NOISE_FILTER: &str = "ort=warn";
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_RETENTION_FILES: usize = 14;

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static WRITING_CRASH_REPORT: AtomicBool = AtomicBool::new(false);
static CRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    Train,
    Benchmark,
}

impl RuntimeLogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Benchmark => "benchmark",
        }
    }
}

/// Inputs to filter selection, gathered from the command line and `RUST_LOG`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub verbose: u8,
    pub cli_filter: Option<String>,
    pub env_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogSettings {
    /// `--log-filter` wins, then `-v`/`-vv`, then `RUST_LOG`, then `info`.
    ///
    /// Runtime noise is only muted when the user did not ask for something
    /// explicit on the command line.
    pub fn filters(&self) -> LogFilters {
        let explicit = self.cli_filter.clone().or(match self.verbose {
            0 => None,
            1 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        });
        match explicit {
            Some(filter) => LogFilters {
                console: filter.clone(),
                file: filter,
            },
            None => {
                let base = self
                    .env_filter
                    .as_deref()
                    .filter(|filter| !filter.trim().is_empty())
                    .unwrap_or(DEFAULT_LOG_FILTER);
                LogFilters {
                    console: format!("{CONSOLE_NOISE_FILTER},{base}"),
                    file: format!("{FILE_NOISE_FILTER},{base}"),
                }
            }
        }
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

pub fn crash_dir(data_dir: &Path) -> PathBuf {
    log_dir(data_dir).join(CRASH_DIR_NAME)
}

/// Daily-rotated log file for `mode`, keeping the last [`LOG_RETENTION_FILES`] days.
pub fn rolling_appender(data_dir: &Path, mode: RuntimeLogMode) -> Result<RollingFileAppender> {
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(format!("vfilab-{}", mode.as_str()))
        .filename_suffix("log")
        .max_log_files(LOG_RETENTION_FILES)
        .build(&dir)
        .with_context(|| format!("failed to open rolling log in {}", dir.display()))
}

/// Chain a hook that writes one report per panic into `crash_dir`.
///
/// Returns the directory the active hook writes to; a second call keeps the
/// first hook and its directory.
pub fn install_panic_hook(crash_dir: &Path) -> Result<PathBuf> {
    if let Some(existing) = CRASH_DIR.get() {
        return Ok(existing.clone());
    }
    fs::create_dir_all(crash_dir).with_context(|| {
        format!("failed to create crash report directory: {}", crash_dir.display())
    })?;

    let mut installed = false;
    let active = CRASH_DIR.get_or_init(|| {
        installed = true;
        crash_dir.to_path_buf()
    });
    if installed {
        let previous = panic::take_hook();
        let target = active.clone();
        panic::set_hook(Box::new(move |info| {
            record_panic(&target, info);
            previous(info);
        }));
    }
    Ok(active.clone())
}

fn record_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    if WRITING_CRASH_REPORT.swap(true, Ordering::AcqRel) {
        return;
    }
    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_crash_report(crash_dir, &CrashReport::capture(info))
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: could not write crash report under '{}': {error:#}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash report writer panicked under '{}'",
            crash_dir.display()
        ),
    }
    WRITING_CRASH_REPORT.store(false, Ordering::Release);
}

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread: String,
    location: String,
    message: String,
    backtrace: Backtrace,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            thread: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            location: info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: payload_message(info.payload()),
            backtrace: Backtrace::capture(),
        }
    }
}

fn write_crash_report(crash_dir: &Path, report: &CrashReport) -> Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;
    let seq = CRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "panic-{}-{seq:06}.log",
        report.timestamp.format("%Y%m%d-%H%M%S-%f")
    ));

    let backtrace = match report.backtrace.status() {
        BacktraceStatus::Captured => report.backtrace.to_string(),
        BacktraceStatus::Disabled => "<disabled; set RUST_BACKTRACE=1 to capture>".to_string(),
        _ => "<unsupported>".to_string(),
    };

    let mut file = fs::File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writeln!(file, "timestamp_utc={}", report.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", report.thread)?;
    writeln!(file, "location={}", report.location)?;
    writeln!(file, "payload={}", report.message)?;
    writeln!(file, "backtrace:\n{backtrace}")?;
    file.flush()?;
    Ok(path)
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
