//! Frame triplet datasets and the prefetching batch loader.
//!
//! A split directory holds one sub-directory per sample:
//!
//! ```text
//! <split>/<sample_id>/frame1.png   first input
//! <split>/<sample_id>/frame2.png   ground-truth middle frame
//! <split>/<sample_id>/frame3.png   second input
//! ```
//!
//! `.jpg` and `.jpeg` are accepted as well. Samples are packed as 9 channels:
//! frame1, frame3, then frame2.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, ensure, Context, Result};
use ndarray::{s, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::imaging::load_frame;
use crate::schedule::steps_per_epoch;
use crate::types::{Batch, FRAME_CHANNELS, SAMPLE_CHANNELS};

pub const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Locate `<dir>/<stem>.{png,jpg,jpeg}`.
pub fn find_frame(dir: &Path, stem: &str) -> Option<PathBuf> {
    FRAME_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|path| path.is_file())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripletSample {
    pub id: String,
    pub first: PathBuf,
    pub middle: PathBuf,
    pub last: PathBuf,
}

impl TripletSample {
    /// `None` when any of the three frames is missing.
    pub fn from_dir(dir: &Path) -> Option<Self> {
        let id = dir.file_name()?.to_string_lossy().into_owned();
        Some(Self {
            id,
            first: find_frame(dir, "frame1")?,
            middle: find_frame(dir, "frame2")?,
            last: find_frame(dir, "frame3")?,
        })
    }

    /// Decode the three frames into one `[9, H, W]` tensor.
    pub fn load_packed(&self) -> Result<Array3<f32>> {
        let first = load_frame(&self.first)?;
        let last = load_frame(&self.last)?;
        let middle = load_frame(&self.middle)?;
        ensure!(
            first.dim() == last.dim() && first.dim() == middle.dim(),
            "frames of sample '{}' differ in size: {:?} / {:?} / {:?}",
            self.id,
            first.shape(),
            middle.shape(),
            last.shape()
        );
        let (_, h, w) = first.dim();
        let mut packed = Array3::<f32>::zeros((SAMPLE_CHANNELS, h, w));
        packed.slice_mut(s![0..FRAME_CHANNELS, .., ..]).assign(&first);
        packed
            .slice_mut(s![FRAME_CHANNELS..2 * FRAME_CHANNELS, .., ..])
            .assign(&last);
        packed
            .slice_mut(s![2 * FRAME_CHANNELS..SAMPLE_CHANNELS, .., ..])
            .assign(&middle);
        Ok(packed)
    }
}

#[derive(Debug, Clone)]
pub struct TripletDataset {
    root: PathBuf,
    samples: Vec<TripletSample>,
}

impl TripletDataset {
    /// Scan `root` for sample directories, sorted by name.
    ///
    /// Directories without a complete triplet are skipped with a warning.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            bail!("Dataset directory does not exist: {}", root.display());
        }
        let mut dirs: Vec<PathBuf> = fs::read_dir(root)
            .with_context(|| format!("Failed to list {}", root.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        let mut samples = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match TripletSample::from_dir(&dir) {
                Some(sample) => samples.push(sample),
                None => warn!(dir = %dir.display(), "Skipping directory without frame1/frame2/frame3"),
            }
        }

        info!(root = %root.display(), samples = samples.len(), "Dataset scanned");
        Ok(Self {
            root: root.to_path_buf(),
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[TripletSample] {
        &self.samples
    }

    /// Decode and stack the samples at `indices`. All must share one size.
    pub fn load_batch(&self, indices: &[usize]) -> Result<Batch> {
        ensure!(!indices.is_empty(), "cannot load an empty batch");
        let mut frames = Vec::with_capacity(indices.len());
        let mut ids = Vec::with_capacity(indices.len());
        for &index in indices {
            let sample = self
                .samples
                .get(index)
                .ok_or_else(|| anyhow!("sample index {index} out of range ({})", self.len()))?;
            frames.push(sample.load_packed()?);
            ids.push(sample.id.clone());
        }

        let first_dim = frames[0].dim();
        if let Some(pos) = frames.iter().position(|f| f.dim() != first_dim) {
            bail!(
                "batch mixes frame sizes: '{}' is {:?}, '{}' is {:?}",
                ids[0],
                first_dim,
                ids[pos],
                frames[pos].dim()
            );
        }

        let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
        let data: Array4<f32> = ndarray::stack(Axis(0), &views).context("failed to stack batch")?;
        Ok(Batch { data, ids })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    /// Decoded batches buffered ahead of the consumer.
    pub prefetch: usize,
    pub rank: usize,
    pub world_size: usize,
}

impl LoaderOptions {
    pub fn sequential(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            prefetch: 2,
            rank: 0,
            world_size: 1,
        }
    }
}

/// Iterates a dataset in batches, decoding ahead on a background thread.
pub struct TripletLoader {
    dataset: Arc<TripletDataset>,
    options: LoaderOptions,
    rng: StdRng,
}

impl TripletLoader {
    pub fn new(dataset: Arc<TripletDataset>, options: LoaderOptions, rng: StdRng) -> Result<Self> {
        ensure!(options.batch_size > 0, "batch size must be positive");
        ensure!(options.world_size > 0, "world size must be positive");
        ensure!(
            options.rank < options.world_size,
            "rank {} is outside world size {}",
            options.rank,
            options.world_size
        );
        Ok(Self {
            dataset,
            options,
            rng,
        })
    }

    pub fn dataset(&self) -> &TripletDataset {
        &self.dataset
    }

    /// Samples this rank sees per epoch.
    pub fn shard_len(&self) -> usize {
        let len = self.dataset.len();
        let world = self.options.world_size;
        len / world + usize::from(self.options.rank < len % world)
    }

    pub fn steps_per_epoch(&self) -> u64 {
        steps_per_epoch(self.shard_len(), self.options.batch_size)
    }

    /// Index order for the next epoch, shuffled when enabled, then sharded.
    fn epoch_order(&mut self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            order.shuffle(&mut self.rng);
        }
        order
            .into_iter()
            .skip(self.options.rank)
            .step_by(self.options.world_size)
            .collect()
    }

    /// Start decoding one epoch. The final batch may be smaller.
    pub fn epoch(&mut self) -> BatchStream {
        let order = self.epoch_order();
        let chunks: Vec<Vec<usize>> = order
            .chunks(self.options.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        let dataset = Arc::clone(&self.dataset);
        let (tx, rx) = sync_channel(self.options.prefetch.max(1));

        debug!(batches = chunks.len(), "Prefetch thread starting");
        let handle = thread::spawn(move || {
            for indices in chunks {
                let result = dataset.load_batch(&indices);
                let failed = result.is_err();
                if tx.send(result).is_err() || failed {
                    break;
                }
            }
        });

        BatchStream {
            rx,
            handle: Some(handle),
        }
    }
}

/// Anything that can hand out epochs of batches to the training loop.
pub trait BatchSource {
    fn steps_per_epoch(&self) -> u64;
    fn next_epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>>>;
}

impl BatchSource for TripletLoader {
    fn steps_per_epoch(&self) -> u64 {
        TripletLoader::steps_per_epoch(self)
    }

    fn next_epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>>> {
        Box::new(self.epoch())
    }
}

/// Batches of one epoch in order. Ends after the first error.
pub struct BatchStream {
    rx: Receiver<Result<Batch>>,
    handle: Option<JoinHandle<()>>,
}

impl Iterator for BatchStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rx.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                let handle = self.handle.take()?;
                if handle.join().is_err() {
                    return Some(Err(anyhow!("prefetch thread panicked")));
                }
                None
            }
        }
    }
}
