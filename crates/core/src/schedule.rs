//! Learning-rate schedule: linear warmup followed by cosine annealing.

use std::f64::consts::PI;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub warmup_steps: u64,
    /// Rate reached at the end of warmup.
    pub warmup_peak: f64,
    /// Rate at the start of the cosine phase.
    pub decay_peak: f64,
    /// Rate the cosine phase settles at.
    pub floor: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            warmup_steps: 2000,
            warmup_peak: 5e-4,
            decay_peak: 3e-4,
            floor: 3e-6,
        }
    }
}

/// Schedule bound to a fixed training length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    config: ScheduleConfig,
    total_steps: u64,
}

impl LearningRateSchedule {
    /// Bind `config` to `total_steps = epochs * steps_per_epoch`.
    ///
    /// Fails when the run is not longer than the warmup, since the cosine phase
    /// would have no steps to anneal over.
    pub fn new(config: ScheduleConfig, total_steps: u64) -> Result<Self> {
        ensure!(
            total_steps > config.warmup_steps,
            "total training steps ({total_steps}) must exceed warmup steps ({}); \
             increase --epoch or reduce --batch_size",
            config.warmup_steps
        );
        ensure!(
            config.floor <= config.decay_peak,
            "schedule floor ({}) must not exceed decay peak ({})",
            config.floor,
            config.decay_peak
        );
        Ok(Self {
            config,
            total_steps,
        })
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Learning rate for `step`. Steps beyond `total_steps` hold the floor.
    pub fn rate(&self, step: u64) -> f64 {
        let cfg = &self.config;
        if step < cfg.warmup_steps {
            return cfg.warmup_peak * (step as f64 / cfg.warmup_steps as f64);
        }

        let decay_span = (self.total_steps - cfg.warmup_steps) as f64;
        let progress = ((step - cfg.warmup_steps) as f64 / decay_span).min(1.0);
        let mul = (progress * PI).cos() * 0.5 + 0.5;
        (cfg.decay_peak - cfg.floor) * mul + cfg.floor
    }
}

/// Batches per epoch for a loader that keeps the short tail batch.
pub fn steps_per_epoch(dataset_len: usize, batch_size: usize) -> u64 {
    if batch_size == 0 {
        return 0;
    }
    dataset_len.div_ceil(batch_size) as u64
}
