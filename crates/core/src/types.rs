use ndarray::{s, Array4, ArrayView4};
use serde::{Deserialize, Serialize};

/// Channels per frame (RGB).
pub const FRAME_CHANNELS: usize = 3;
/// Channels in a packed training sample: img0 (3) + img1 (3) + ground truth (3).
pub const SAMPLE_CHANNELS: usize = 3 * FRAME_CHANNELS;
/// Channels in an optical flow field.
pub const FLOW_CHANNELS: usize = 2;

/// A batch of packed triplets as produced by the data loader.
///
/// `data` is NCHW with 9 channels: `[0..6)` are the two input frames, `[6..9)`
/// the ground-truth middle frame. `ids` holds one sample directory name per row
/// and namespaces saved outputs.
#[derive(Debug, Clone)]
pub struct Batch {
    pub data: Array4<f32>,
    pub ids: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Both input frames, `[B, 6, H, W]`.
    pub fn inputs(&self) -> ArrayView4<'_, f32> {
        self.data.slice(s![.., 0..2 * FRAME_CHANNELS, .., ..])
    }

    /// Ground-truth middle frames, `[B, 3, H, W]`.
    pub fn ground_truth(&self) -> ArrayView4<'_, f32> {
        self.data
            .slice(s![.., 2 * FRAME_CHANNELS..SAMPLE_CHANNELS, .., ..])
    }

    pub fn height(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[3]
    }
}

/// Auxiliary outputs of one distillation update.
///
/// All tensors are NCHW. `mask*` are single-channel blend masks, `flow*` two-channel
/// displacement fields, `merged_teacher` the frame produced by the privileged path.
#[derive(Debug, Clone)]
pub struct UpdateInfo {
    pub loss_l1: f32,
    pub loss_teacher: f32,
    pub loss_distill: f32,
    pub mask: Array4<f32>,
    pub mask_teacher: Array4<f32>,
    pub merged_teacher: Array4<f32>,
    pub flow: Array4<f32>,
    pub flow_teacher: Array4<f32>,
}

/// Counters owned by the training loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    pub global_step: u64,
    pub epoch: u32,
    pub eval_count: u32,
}

/// Role of this process in a (possibly multi-process) run.
///
/// Summaries, checkpoints, progress lines and visualizations are only produced
/// by the coordinator. Data sharding across processes is the loader's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRole {
    pub rank: usize,
    pub is_coordinator: bool,
}

impl ProcessRole {
    pub fn from_rank(rank: usize) -> Self {
        Self {
            rank,
            is_coordinator: rank == 0,
        }
    }

    pub fn single_process() -> Self {
        Self::from_rank(0)
    }
}

impl Default for ProcessRole {
    fn default() -> Self {
        Self::single_process()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_views_split_packed_channels() {
        let mut data = Array4::<f32>::zeros((2, SAMPLE_CHANNELS, 4, 8));
        for c in 0..SAMPLE_CHANNELS {
            data.slice_mut(s![.., c, .., ..]).fill(c as f32);
        }
        let batch = Batch {
            data,
            ids: vec!["a".to_string(), "b".to_string()],
        };

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.inputs().shape(), &[2, 6, 4, 8]);
        assert_eq!(batch.ground_truth().shape(), &[2, 3, 4, 8]);
        assert_eq!(batch.inputs()[[1, 5, 0, 0]], 5.0);
        assert_eq!(batch.ground_truth()[[0, 0, 3, 7]], 6.0);
        assert_eq!(batch.height(), 4);
        assert_eq!(batch.width(), 8);
    }

    #[test]
    fn only_rank_zero_coordinates() {
        assert!(ProcessRole::from_rank(0).is_coordinator);
        assert!(!ProcessRole::from_rank(3).is_coordinator);
        assert_eq!(ProcessRole::default(), ProcessRole::single_process());
    }
}
