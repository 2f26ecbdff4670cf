//! Reference interpolation model implemented directly on `ndarray`.
//!
//! The student blends the two inputs with a learned per-channel weight and
//! bias. The teacher sees the ground truth and picks, per pixel, whichever
//! input is closer to it. Both paths produce a mask and a displacement proxy
//! so the evaluation loop can visualize them like a flow network's outputs.

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use ndarray::{s, Array4, ArrayView4, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::checkpoint::{read_checkpoint, write_checkpoint, CheckpointSpec};
use super::InterpolationModel;
use crate::types::{UpdateInfo, FLOW_CHANNELS, FRAME_CHANNELS};

pub const ARCHITECTURE: &str = "blend";
pub const FORMAT_VERSION: u32 = 1;
pub const PARAMS_FILE_NAME: &str = "blend.json";

/// Weight of the student-vs-teacher term in the training objective.
pub const DISTILL_WEIGHT: f32 = 0.01;

const CHECKPOINT: CheckpointSpec<'static> = CheckpointSpec {
    architecture: ARCHITECTURE,
    format_version: FORMAT_VERSION,
    params_file: PARAMS_FILE_NAME,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendParams {
    /// Share of `img0` in the blend, per RGB channel.
    pub weight: [f32; FRAME_CHANNELS],
    pub bias: [f32; FRAME_CHANNELS],
}

#[derive(Debug, Clone)]
pub struct BlendModel {
    params: BlendParams,
}

impl BlendModel {
    /// Start near an even blend with a little seeded jitter.
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        let mut weight = [0.5f32; FRAME_CHANNELS];
        for w in &mut weight {
            *w += rng.random_range(-0.05f32..0.05);
        }
        Self {
            params: BlendParams {
                weight,
                bias: [0.0; FRAME_CHANNELS],
            },
        }
    }

    pub fn from_params(params: BlendParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &BlendParams {
        &self.params
    }

    fn forward(&self, img0: ArrayView4<'_, f32>, img1: ArrayView4<'_, f32>) -> Array4<f32> {
        let mut out = Array4::<f32>::zeros(img0.raw_dim());
        for c in 0..FRAME_CHANNELS {
            let w = self.params.weight[c];
            let b = self.params.bias[c];
            Zip::from(out.slice_mut(s![.., c, .., ..]))
                .and(img0.slice(s![.., c, .., ..]))
                .and(img1.slice(s![.., c, .., ..]))
                .for_each(|o, &a, &z| *o = w * a + (1.0 - w) * z + b);
        }
        out
    }

    fn student_mask(&self, batch: usize, height: usize, width: usize) -> Array4<f32> {
        let mean_weight = self.params.weight.iter().sum::<f32>() / FRAME_CHANNELS as f32;
        Array4::from_elem((batch, 1, height, width), mean_weight)
    }

    fn step(
        &mut self,
        inputs: (ArrayView4<'_, f32>, ArrayView4<'_, f32>),
        prediction: ArrayView4<'_, f32>,
        ground_truth: ArrayView4<'_, f32>,
        teacher: ArrayView4<'_, f32>,
        learning_rate: f32,
    ) {
        let (img0, img1) = inputs;
        let per_channel = (prediction.len() / FRAME_CHANNELS).max(1) as f32;
        for c in 0..FRAME_CHANNELS {
            let (grad_w, grad_b) = Zip::from(prediction.slice(s![.., c, .., ..]))
                .and(ground_truth.slice(s![.., c, .., ..]))
                .and(teacher.slice(s![.., c, .., ..]))
                .and(img0.slice(s![.., c, .., ..]))
                .and(img1.slice(s![.., c, .., ..]))
                .fold((0.0f32, 0.0f32), |(gw, gb), &p, &g, &t, &a, &z| {
                    let s = sign(p - g) + DISTILL_WEIGHT * sign(p - t);
                    (gw + s * (a - z), gb + s)
                });
            let w = &mut self.params.weight[c];
            *w = (*w - learning_rate * grad_w / per_channel).clamp(0.0, 1.0);
            let b = &mut self.params.bias[c];
            *b = (*b - learning_rate * grad_b / per_channel).clamp(-1.0, 1.0);
        }
    }
}

impl InterpolationModel for BlendModel {
    fn name(&self) -> &str {
        ARCHITECTURE
    }

    fn update(
        &mut self,
        inputs: ArrayView4<'_, f32>,
        ground_truth: ArrayView4<'_, f32>,
        learning_rate: f64,
        training: bool,
    ) -> Result<(Array4<f32>, UpdateInfo)> {
        let (img0, img1) = split_inputs(inputs)?;
        ensure!(
            ground_truth.dim() == img0.dim(),
            "ground truth shape {:?} does not match input frame shape {:?}",
            ground_truth.shape(),
            img0.shape()
        );
        let (batch, _, height, width) = img0.dim();
        ensure!(batch > 0, "cannot update on an empty batch");

        let prediction = self.forward(img0, img1);
        let (mask_teacher, merged_teacher) = teacher_path(img0, img1, ground_truth);
        let mask = self.student_mask(batch, height, width);

        let loss_l1 = mean_abs_diff(prediction.view(), ground_truth);
        let loss_teacher = mean_abs_diff(merged_teacher.view(), ground_truth);
        let loss_distill = mean_abs_diff(prediction.view(), merged_teacher.view());

        if training {
            self.step(
                (img0, img1),
                prediction.view(),
                ground_truth,
                merged_teacher.view(),
                learning_rate as f32,
            );
        }

        let info = UpdateInfo {
            loss_l1,
            loss_teacher,
            loss_distill,
            flow: displacement_proxy(img0, img1, mask.view()),
            flow_teacher: displacement_proxy(img0, img1, mask_teacher.view()),
            mask,
            mask_teacher,
            merged_teacher,
        };
        Ok((prediction, info))
    }

    fn inference(
        &mut self,
        img0: ArrayView4<'_, f32>,
        img1: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>> {
        ensure!(
            img0.dim() == img1.dim(),
            "input frames differ in shape: {:?} vs {:?}",
            img0.shape(),
            img1.shape()
        );
        ensure!(
            img0.shape()[1] == FRAME_CHANNELS,
            "expected {FRAME_CHANNELS}-channel frames, got {}",
            img0.shape()[1]
        );
        Ok(self.forward(img0, img1))
    }

    fn save_model(&self, dir: &Path, rank: usize) -> Result<()> {
        if rank != 0 {
            debug!(rank, "Skipping checkpoint save on non-zero rank");
            return Ok(());
        }
        let bytes =
            serde_json::to_vec_pretty(&self.params).context("Failed to encode blend parameters")?;
        write_checkpoint(dir, &CHECKPOINT, &bytes)
    }

    fn load_model(&mut self, dir: &Path) -> Result<()> {
        let bytes = read_checkpoint(dir, &CHECKPOINT)?;
        self.params = serde_json::from_slice(&bytes).with_context(|| {
            format!(
                "Failed to decode {}",
                dir.join(PARAMS_FILE_NAME).display()
            )
        })?;
        debug!(weight = ?self.params.weight, bias = ?self.params.bias, "Blend parameters loaded");
        Ok(())
    }
}

/// Split a packed `[B, 6, H, W]` input into its two frames.
pub(crate) fn split_inputs(
    inputs: ArrayView4<'_, f32>,
) -> Result<(ArrayView4<'_, f32>, ArrayView4<'_, f32>)> {
    if inputs.shape()[1] != 2 * FRAME_CHANNELS {
        bail!(
            "expected {} input channels, got {}",
            2 * FRAME_CHANNELS,
            inputs.shape()[1]
        );
    }
    let (img0, img1) = inputs.split_at(ndarray::Axis(1), FRAME_CHANNELS);
    Ok((img0, img1))
}

pub(crate) fn mean_abs_diff(a: ArrayView4<'_, f32>, b: ArrayView4<'_, f32>) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    let sum = Zip::from(&a)
        .and(&b)
        .fold(0.0f64, |acc, &x, &y| acc + f64::from((x - y).abs()));
    (sum / a.len() as f64) as f32
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Per-pixel selection of the input closer to the ground truth (L1 over channels).
fn teacher_path(
    img0: ArrayView4<'_, f32>,
    img1: ArrayView4<'_, f32>,
    ground_truth: ArrayView4<'_, f32>,
) -> (Array4<f32>, Array4<f32>) {
    let (batch, channels, height, width) = img0.dim();
    let mut mask = Array4::<f32>::zeros((batch, 1, height, width));
    let mut merged = Array4::<f32>::zeros((batch, channels, height, width));
    for ((b, _, y, x), m) in mask.indexed_iter_mut() {
        let mut d0 = 0.0f32;
        let mut d1 = 0.0f32;
        for c in 0..channels {
            let g = ground_truth[[b, c, y, x]];
            d0 += (img0[[b, c, y, x]] - g).abs();
            d1 += (img1[[b, c, y, x]] - g).abs();
        }
        *m = if d0 <= d1 { 1.0 } else { 0.0 };
        for c in 0..channels {
            merged[[b, c, y, x]] = *m * img0[[b, c, y, x]] + (1.0 - *m) * img1[[b, c, y, x]];
        }
    }
    (mask, merged)
}

/// Two-channel field from the temporal intensity change, split by the blend mask.
fn displacement_proxy(
    img0: ArrayView4<'_, f32>,
    img1: ArrayView4<'_, f32>,
    mask: ArrayView4<'_, f32>,
) -> Array4<f32> {
    let (batch, channels, height, width) = img0.dim();
    let mut flow = Array4::<f32>::zeros((batch, FLOW_CHANNELS, height, width));
    for b in 0..batch {
        for y in 0..height {
            for x in 0..width {
                let delta = (0..channels)
                    .map(|c| img1[[b, c, y, x]] - img0[[b, c, y, x]])
                    .sum::<f32>()
                    / channels as f32;
                let m = mask[[b, 0, y, x]];
                flow[[b, 0, y, x]] = delta * (1.0 - m);
                flow[[b, 1, y, x]] = -delta * m;
            }
        }
    }
    flow
}
