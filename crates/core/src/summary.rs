//! Monitoring sink for scalar and image summaries.
//!
//! Summaries are keyed by string tags (`loss/l1`, `0/img`, ...) and a step.
//! [`EventLogWriter`] appends one JSON object per event to `events.jsonl`
//! and stores images as PNG files beside it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::imaging::save_png;

pub const EVENTS_FILE_NAME: &str = "events.jsonl";
pub const IMAGES_DIR_NAME: &str = "images";

pub trait SummaryWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()>;
    /// `image` is a CHW frame with values in `[0, 1]`.
    fn add_image(&mut self, tag: &str, image: ArrayView3<'_, f32>, step: u64) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryEvent {
    Scalar {
        tag: String,
        step: u64,
        value: f64,
        wall_time: String,
    },
    Image {
        tag: String,
        step: u64,
        path: PathBuf,
        width: usize,
        height: usize,
        wall_time: String,
    },
}

/// Append-only event log under a run directory such as `summaries/train`.
pub struct EventLogWriter {
    run_dir: PathBuf,
    events: BufWriter<File>,
}

impl EventLogWriter {
    pub fn create(run_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)
            .with_context(|| format!("failed to create summary directory: {}", run_dir.display()))?;
        let events_path = run_dir.join(EVENTS_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .with_context(|| format!("failed to open summary log: {}", events_path.display()))?;
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            events: BufWriter::new(file),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn append(&mut self, event: &SummaryEvent) -> Result<()> {
        serde_json::to_writer(&mut self.events, event).context("failed to encode summary event")?;
        self.events
            .write_all(b"\n")
            .context("failed to append summary event")
    }
}

fn wall_time() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Tags contain `/`; keep them as nested directories but never escape the run dir.
fn image_relative_path(tag: &str, step: u64) -> PathBuf {
    let mut path = PathBuf::from(IMAGES_DIR_NAME);
    for part in tag.split('/').filter(|p| !p.is_empty() && *p != "." && *p != "..") {
        path.push(part);
    }
    path.push(format!("{step:08}.png"));
    path
}

impl SummaryWriter for EventLogWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.append(&SummaryEvent::Scalar {
            tag: tag.to_string(),
            step,
            value,
            wall_time: wall_time(),
        })
    }

    fn add_image(&mut self, tag: &str, image: ArrayView3<'_, f32>, step: u64) -> Result<()> {
        let relative = image_relative_path(tag, step);
        save_png(image, &self.run_dir.join(&relative))?;
        let (_, height, width) = image.dim();
        self.append(&SummaryEvent::Image {
            tag: tag.to_string(),
            step,
            path: relative,
            width,
            height,
            wall_time: wall_time(),
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.events.flush().context("failed to flush summary log")
    }
}

impl Drop for EventLogWriter {
    fn drop(&mut self) {
        let _ = self.events.flush();
    }
}

/// Sink used on non-coordinator ranks.
#[derive(Debug, Default)]
pub struct DisabledSummaryWriter;

impl SummaryWriter for DisabledSummaryWriter {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: u64) -> Result<()> {
        Ok(())
    }

    fn add_image(&mut self, _tag: &str, _image: ArrayView3<'_, f32>, _step: u64) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps every summary in memory.
#[derive(Debug, Default)]
pub struct MemorySummaryWriter {
    pub scalars: Vec<(String, u64, f64)>,
    pub images: Vec<(String, u64, Array3<f32>)>,
}

impl MemorySummaryWriter {
    pub fn scalars_for(&self, tag: &str) -> Vec<(u64, f64)> {
        self.scalars
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, step, value)| (*step, *value))
            .collect()
    }

    pub fn image_tags(&self) -> Vec<&str> {
        self.images.iter().map(|(tag, _, _)| tag.as_str()).collect()
    }
}

impl SummaryWriter for MemorySummaryWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.scalars.push((tag.to_string(), step, value));
        Ok(())
    }

    fn add_image(&mut self, tag: &str, image: ArrayView3<'_, f32>, step: u64) -> Result<()> {
        self.images.push((tag.to_string(), step, image.to_owned()));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
