//! Pre-trained RIFE-style interpolation networks run through ONNX Runtime.
//!
//! Inference only: the exported graph carries no optimizer, so
//! `update(.., training = true)` is rejected. Evaluation still works, with the
//! prediction standing in for the teacher path.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use ndarray::{s, Array4, ArrayView4, Axis, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info};

use super::backend::{build_session, InferenceBackend, SessionConfig};
use super::blend::{mean_abs_diff, split_inputs};
use super::checkpoint::{self, CheckpointSpec, MANIFEST_FILE_NAME};
use super::InterpolationModel;
use crate::imaging::{crop, replicate_pad, Padding};
use crate::types::{UpdateInfo, FLOW_CHANNELS, FRAME_CHANNELS};

pub const ARCHITECTURE: &str = "rife-onnx";
pub const FORMAT_VERSION: u32 = 1;
pub const MODEL_FILE_NAME: &str = "flownet.onnx";

const CHECKPOINT: CheckpointSpec<'static> = CheckpointSpec {
    architecture: ARCHITECTURE,
    format_version: FORMAT_VERSION,
    params_file: MODEL_FILE_NAME,
};

const INPUT_IMG0: &str = "img0";
const INPUT_IMG1: &str = "img1";
const INPUT_TIMESTEP: &str = "timestep";
/// Single concatenated input name used by newer exports.
const INPUT_CONCAT: &str = "input";
const OUTPUT_NAME: &str = "output";

const MIDPOINT: f32 = 0.5;

/// ONNX model input format detected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// Separate `img0`, `img1`, `timestep` inputs.
    ThreeInput,
    /// Single input of shape `[1, 7, H, W]`: both frames plus a timestep plane.
    Concatenated,
}

pub struct OnnxInterpolator {
    backend: InferenceBackend,
    trt_cache_dir: Option<PathBuf>,
    session: Option<Session>,
    model_format: ModelFormat,
    model_path: Option<PathBuf>,
}

impl OnnxInterpolator {
    pub fn new(backend: InferenceBackend, trt_cache_dir: Option<PathBuf>) -> Self {
        Self {
            backend,
            trt_cache_dir,
            session: None,
            model_format: ModelFormat::ThreeInput,
            model_path: None,
        }
    }

    pub fn model_format(&self) -> ModelFormat {
        self.model_format
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .context("ONNX model is not loaded; call load_model with a checkpoint directory first")
    }

    /// Run one aligned `[1, 3, H, W]` pair through the session.
    fn run_pair(&mut self, img0: Array4<f32>, img1: Array4<f32>) -> Result<Array4<f32>> {
        let format = self.model_format;
        let session = self.session_mut()?;
        let started = Instant::now();
        let output = match format {
            ModelFormat::ThreeInput => run_three_input(session, img0, img1, MIDPOINT)?,
            ModelFormat::Concatenated => run_concatenated(session, img0, img1, MIDPOINT)?,
        };
        debug!(
            session_run_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            ?format,
            "ONNX interpolation"
        );
        Ok(output)
    }
}

impl InterpolationModel for OnnxInterpolator {
    fn name(&self) -> &str {
        ARCHITECTURE
    }

    fn has_teacher(&self) -> bool {
        false
    }

    fn update(
        &mut self,
        inputs: ArrayView4<'_, f32>,
        ground_truth: ArrayView4<'_, f32>,
        _learning_rate: f64,
        training: bool,
    ) -> Result<(Array4<f32>, UpdateInfo)> {
        if training {
            bail!("{ARCHITECTURE} models are inference-only and cannot be trained");
        }
        let (img0, img1) = split_inputs(inputs)?;
        ensure!(
            ground_truth.dim() == img0.dim(),
            "ground truth shape {:?} does not match input frame shape {:?}",
            ground_truth.shape(),
            img0.shape()
        );
        let prediction = self.inference(img0, img1)?;
        let (batch, _, height, width) = prediction.dim();
        let loss = mean_abs_diff(prediction.view(), ground_truth);

        let info = UpdateInfo {
            loss_l1: loss,
            loss_teacher: loss,
            loss_distill: 0.0,
            mask: Array4::zeros((batch, 1, height, width)),
            mask_teacher: Array4::zeros((batch, 1, height, width)),
            merged_teacher: prediction.clone(),
            flow: Array4::zeros((batch, FLOW_CHANNELS, height, width)),
            flow_teacher: Array4::zeros((batch, FLOW_CHANNELS, height, width)),
        };
        Ok((prediction, info))
    }

    /// Unaligned frames are replicate-padded to the network stride and the
    /// output is cropped back.
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
        let (batch, channels, height, width) = img0.dim();
        ensure!(
            channels == FRAME_CHANNELS,
            "expected {FRAME_CHANNELS}-channel frames, got {channels}"
        );

        let padding = Padding::to_alignment(height, width);
        let mut output = Array4::<f32>::zeros((batch, channels, height, width));
        for b in 0..batch {
            let pair0 = replicate_pad(img0.slice(s![b..b + 1, .., .., ..]), padding);
            let pair1 = replicate_pad(img1.slice(s![b..b + 1, .., .., ..]), padding);
            let raw = self.run_pair(pair0, pair1)?;
            let cropped = crop(raw.view(), padding)?;
            ensure!(
                cropped.dim() == (1, channels, height, width),
                "model output shape {:?} does not match input {:?}",
                cropped.shape(),
                (1, channels, height, width)
            );
            output
                .index_axis_mut(Axis(0), b)
                .assign(&cropped.index_axis(Axis(0), 0));
        }
        Ok(output)
    }

    fn save_model(&self, dir: &Path, rank: usize) -> Result<()> {
        if rank != 0 {
            return Ok(());
        }
        let source = self
            .model_path
            .as_deref()
            .context("no ONNX model loaded, nothing to save")?;
        let bytes = std::fs::read(source)
            .with_context(|| format!("Failed to read {}", source.display()))?;
        checkpoint::write_checkpoint(dir, &CHECKPOINT, &bytes)
    }

    /// Loads `flownet.onnx` from `dir`, verifying it against `manifest.json`
    /// when one is present.
    fn load_model(&mut self, dir: &Path) -> Result<()> {
        let model_path = dir.join(MODEL_FILE_NAME);
        if !model_path.is_file() {
            bail!("ONNX model not found: {}", model_path.display());
        }
        if dir.join(MANIFEST_FILE_NAME).exists() {
            checkpoint::read_checkpoint(dir, &CHECKPOINT)?;
        }

        let session = build_session(&SessionConfig {
            model_path: &model_path,
            backend: &self.backend,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
        })?;
        self.model_format = detect_model_format(&session);
        info!(
            path = %model_path.display(),
            backend = %self.backend,
            format = ?self.model_format,
            "ONNX interpolation model loaded"
        );
        self.session = Some(session);
        self.model_path = Some(model_path);
        Ok(())
    }
}

fn detect_model_format(session: &Session) -> ModelFormat {
    let inputs = session.inputs();
    if inputs.len() == 1 && inputs[0].name() == INPUT_CONCAT {
        ModelFormat::Concatenated
    } else {
        ModelFormat::ThreeInput
    }
}

fn run_three_input(
    session: &mut Session,
    img0: Array4<f32>,
    img1: Array4<f32>,
    timestep: f32,
) -> Result<Array4<f32>> {
    let tensor0 = Tensor::from_array(img0)?;
    let tensor1 = Tensor::from_array(img1)?;
    let ts_tensor = Tensor::from_array(Array4::<f32>::from_elem((1, 1, 1, 1), timestep))?;

    let outputs = session.run(
        ort::inputs![INPUT_IMG0 => &tensor0, INPUT_IMG1 => &tensor1, INPUT_TIMESTEP => &ts_tensor],
    )?;
    let output_view = outputs[OUTPUT_NAME].try_extract_array::<f32>()?;
    Ok(output_view.to_owned().into_dimensionality::<Ix4>()?)
}

fn run_concatenated(
    session: &mut Session,
    img0: Array4<f32>,
    img1: Array4<f32>,
    timestep: f32,
) -> Result<Array4<f32>> {
    let concat = concat_input(img0.view(), img1.view(), timestep);
    let tensor = Tensor::from_array(concat)?;

    let outputs = session.run(ort::inputs![INPUT_CONCAT => tensor])?;
    let output_view = outputs[OUTPUT_NAME].try_extract_array::<f32>()?;
    Ok(output_view.to_owned().into_dimensionality::<Ix4>()?)
}

/// `[1, 7, H, W]`: img0, img1, then a constant timestep plane.
fn concat_input(img0: ArrayView4<'_, f32>, img1: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32> {
    let (_, _, h, w) = img0.dim();
    let mut concat = Array4::<f32>::from_elem((1, 2 * FRAME_CHANNELS + 1, h, w), timestep);
    concat
        .slice_mut(s![.., 0..FRAME_CHANNELS, .., ..])
        .assign(&img0);
    concat
        .slice_mut(s![.., FRAME_CHANNELS..2 * FRAME_CHANNELS, .., ..])
        .assign(&img1);
    concat
}
