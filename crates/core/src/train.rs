//! Epoch/step driver for distillation training.
//!
//! Every processed batch advances `global_step` by one. Each epoch ends by
//! bumping `eval_count`, validating when it reaches the configured cadence and
//! then overwriting the checkpoint.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use tracing::{debug, info};

use crate::config::{EvaluationConfig, LabConfig, TrainingConfig};
use crate::dataset::BatchSource;
use crate::evaluate::{evaluate, EvalContext, EvalReport};
use crate::model::InterpolationModel;
use crate::schedule::{LearningRateSchedule, ScheduleConfig};
use crate::summary::SummaryWriter;
use crate::types::{ProcessRole, TrainingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainPhase {
    Idle,
    Running,
    Evaluating,
    Checkpointing,
    Done,
}

/// The parts of [`LabConfig`] the training loop reads.
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub training: TrainingConfig,
    pub schedule: ScheduleConfig,
    pub evaluation: EvaluationConfig,
    pub checkpoint_dir: PathBuf,
    pub output_root: PathBuf,
}

impl TrainerSettings {
    pub fn from_config(config: &LabConfig) -> Self {
        Self {
            training: config.training.clone(),
            schedule: config.schedule,
            evaluation: config.evaluation.clone(),
            checkpoint_dir: config.paths.checkpoint_dir.clone(),
            output_root: config.paths.output_root.clone(),
        }
    }
}

/// Summary sinks for the `train/` and `validate/` runs.
pub struct Summaries<'a> {
    pub train: &'a mut dyn SummaryWriter,
    pub validate: &'a mut dyn SummaryWriter,
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub state: TrainingState,
    pub steps_per_epoch: u64,
    pub total_steps: u64,
    pub evaluations: Vec<EvalReport>,
}

pub struct Trainer<'a> {
    settings: TrainerSettings,
    role: ProcessRole,
    model: &'a mut dyn InterpolationModel,
    train_data: &'a mut dyn BatchSource,
    val_data: &'a mut dyn BatchSource,
    summaries: Summaries<'a>,
    state: TrainingState,
    phase: TrainPhase,
    evaluations: Vec<EvalReport>,
}

/// `step % every == 1`, the offset cadence used for scalar summaries.
fn on_offset_cadence(step: u64, every: u64) -> bool {
    every != 0 && step % every == 1 % every
}

impl<'a> Trainer<'a> {
    pub fn new(
        settings: TrainerSettings,
        role: ProcessRole,
        model: &'a mut dyn InterpolationModel,
        train_data: &'a mut dyn BatchSource,
        val_data: &'a mut dyn BatchSource,
        summaries: Summaries<'a>,
    ) -> Self {
        Self {
            settings,
            role,
            model,
            train_data,
            val_data,
            summaries,
            state: TrainingState::default(),
            phase: TrainPhase::Idle,
            evaluations: Vec::new(),
        }
    }

    pub fn phase(&self) -> TrainPhase {
        self.phase
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    fn enter(&mut self, phase: TrainPhase) {
        debug!(from = ?self.phase, to = ?phase, "Training phase change");
        self.phase = phase;
    }

    /// Run every configured epoch to completion.
    pub fn run(&mut self) -> Result<TrainOutcome> {
        if self.phase != TrainPhase::Idle {
            bail!("trainer already ran (phase {:?})", self.phase);
        }

        let steps_per_epoch = self.train_data.steps_per_epoch();
        let epochs = self.settings.training.epochs;
        let total_steps = u64::from(epochs) * steps_per_epoch;
        let schedule = LearningRateSchedule::new(self.settings.schedule, total_steps)?;
        self.enter(TrainPhase::Running);

        info!(
            epochs,
            steps_per_epoch,
            total_steps,
            seed = self.settings.training.seed.0,
            rank = self.role.rank,
            model = self.model.name(),
            "training..."
        );

        for epoch in 0..epochs {
            self.state.epoch = epoch;
            self.run_epoch(&schedule, steps_per_epoch)?;

            self.state.eval_count += 1;
            let every = self.settings.training.eval_every_epochs;
            if every != 0 && self.state.eval_count % every == 0 {
                self.enter(TrainPhase::Evaluating);
                self.run_evaluation(self.state.eval_count / every)?;
            }

            self.enter(TrainPhase::Checkpointing);
            self.model
                .save_model(&self.settings.checkpoint_dir, self.role.rank)?;
            self.enter(TrainPhase::Running);
        }

        self.enter(TrainPhase::Done);
        info!(
            global_step = self.state.global_step,
            evaluations = self.evaluations.len(),
            "Training finished"
        );
        Ok(TrainOutcome {
            state: self.state,
            steps_per_epoch,
            total_steps,
            evaluations: self.evaluations.clone(),
        })
    }

    fn run_epoch(&mut self, schedule: &LearningRateSchedule, steps_per_epoch: u64) -> Result<()> {
        let epoch = self.state.epoch;
        info!(epoch, "Epoch: {epoch}");
        let scalar_every = self.settings.training.scalar_every_steps;
        let progress_every = self.settings.training.progress_every_batches;

        let mut stamp = Instant::now();
        for (i, batch) in self.train_data.next_epoch().enumerate() {
            let batch = batch?;
            let data_secs = stamp.elapsed().as_secs_f64();
            stamp = Instant::now();

            let step = self.state.global_step;
            let learning_rate = schedule.rate(step);
            let (_, info) = self.model.update(
                batch.inputs(),
                batch.ground_truth(),
                learning_rate,
                true,
            )?;
            let compute_secs = stamp.elapsed().as_secs_f64();
            stamp = Instant::now();

            if self.role.is_coordinator && on_offset_cadence(step, scalar_every) {
                let writer = &mut *self.summaries.train;
                writer.add_scalar("learning_rate", learning_rate, step)?;
                writer.add_scalar("loss/l1", f64::from(info.loss_l1), step)?;
                writer.add_scalar("loss/tea", f64::from(info.loss_teacher), step)?;
                writer.add_scalar("loss/distill", f64::from(info.loss_distill), step)?;
            }

            if self.role.is_coordinator && progress_every != 0 && i % progress_every == 0 {
                info!(
                    "epoch:{epoch} {i}/{steps_per_epoch} time:{data_secs:.2}+{compute_secs:.2} loss_l1:{:.4e}",
                    info.loss_l1
                );
            }

            self.state.global_step += 1;
        }

        if self.role.is_coordinator {
            self.summaries.train.flush()?;
        }
        Ok(())
    }

    fn run_evaluation(&mut self, eval_index: u32) -> Result<()> {
        let ctx = EvalContext {
            role: self.role,
            step: self.state.global_step,
            eval_index,
            output_root: &self.settings.output_root,
            config: &self.settings.evaluation,
        };
        let batches = self.val_data.next_epoch();
        let report = evaluate(&mut *self.model, batches, &ctx, &mut *self.summaries.validate)?;
        self.evaluations.push(report);
        Ok(())
    }
}
