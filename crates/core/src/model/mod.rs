//! Interpolation models driven by the training, evaluation and benchmark loops.
//!
//! Every model is reached through [`InterpolationModel`]. The loops never see a
//! concrete type; [`build_model`] picks one from [`ModelConfig`].

pub mod backend;
pub mod blend;
pub mod checkpoint;
pub mod onnx;

use std::path::Path;

use anyhow::Result;
use ndarray::{Array4, ArrayView4};

use crate::config::{ModelConfig, ModelKind};
use crate::seed::{RngStream, SeedStreams};
use crate::types::UpdateInfo;

pub use backend::InferenceBackend;
pub use blend::BlendModel;
pub use onnx::OnnxInterpolator;

/// Contract between the loops and a frame interpolation network.
///
/// Tensors are NCHW `f32` in `[0, 1]`. `inputs` packs both input frames on the
/// channel axis (6 channels); `ground_truth` and predictions have 3.
pub trait InterpolationModel {
    fn name(&self) -> &str;

    /// Whether `update` runs a separate privileged path. Models without one
    /// report their own prediction as `merged_teacher`.
    fn has_teacher(&self) -> bool {
        true
    }

    /// One distillation step.
    ///
    /// With `training` set the parameters are updated using `learning_rate`;
    /// otherwise this is a forward pass that still reports every loss.
    fn update(
        &mut self,
        inputs: ArrayView4<'_, f32>,
        ground_truth: ArrayView4<'_, f32>,
        learning_rate: f64,
        training: bool,
    ) -> Result<(Array4<f32>, UpdateInfo)>;

    /// Student forward pass predicting the frame halfway between `img0` and `img1`.
    fn inference(&mut self, img0: ArrayView4<'_, f32>, img1: ArrayView4<'_, f32>)
        -> Result<Array4<f32>>;

    /// Persist parameters into `dir`. Only rank 0 writes.
    fn save_model(&self, dir: &Path, rank: usize) -> Result<()>;

    fn load_model(&mut self, dir: &Path) -> Result<()>;
}

/// Construct the configured model with freshly initialized parameters.
pub fn build_model(config: &ModelConfig, streams: &SeedStreams) -> Result<Box<dyn InterpolationModel>> {
    let model: Box<dyn InterpolationModel> = match config.kind {
        ModelKind::Blend => {
            let mut rng = streams.rng(RngStream::ModelInit);
            Box::new(BlendModel::new(&mut rng))
        }
        ModelKind::Onnx => Box::new(OnnxInterpolator::new(
            InferenceBackend::from_str_lossy(&config.backend),
            Some(config.trt_cache_dir.clone()),
        )),
    };
    tracing::info!(model = model.name(), "Model constructed");
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::Seed;

    #[test]
    fn build_model_follows_kind() {
        let streams = SeedStreams::new(Seed::default());
        let blend = build_model(&ModelConfig::default(), &streams).unwrap();
        assert_eq!(blend.name(), blend::ARCHITECTURE);
        assert!(blend.has_teacher());

        let onnx = build_model(
            &ModelConfig {
                kind: ModelKind::Onnx,
                ..ModelConfig::default()
            },
            &streams,
        )
        .unwrap();
        assert_eq!(onnx.name(), onnx::ARCHITECTURE);
        assert!(!onnx.has_teacher());
    }
}
