use std::fs;
use std::path::Path;

use anyhow::Result;
use image::{Rgb, RgbImage};
use ndarray::{s, Array4, ArrayView4, Axis};
use tempfile::tempdir;

use vfilab_core::benchmark::benchmark_case;
use vfilab_core::config::{EvaluationConfig, LabConfig, ModelConfig, TrainingConfig};
use vfilab_core::dataset::{BatchSource, TripletDataset};
use vfilab_core::evaluate::{evaluate, EvalContext};
use vfilab_core::metrics::{psnr, quantize_8bit, ssim_matlab};
use vfilab_core::model::blend::{self, BlendModel, BlendParams};
use vfilab_core::model::checkpoint::MANIFEST_FILE_NAME;
use vfilab_core::model::{build_model, InterpolationModel};
use vfilab_core::schedule::ScheduleConfig;
use vfilab_core::seed::{Seed, SeedStreams};
use vfilab_core::summary::MemorySummaryWriter;
use vfilab_core::train::{Summaries, TrainPhase, Trainer, TrainerSettings};
use vfilab_core::types::{Batch, ProcessRole, UpdateInfo, FLOW_CHANNELS, SAMPLE_CHANNELS};

/// Predicts the ground truth exactly.
struct Oracle;

impl InterpolationModel for Oracle {
    fn name(&self) -> &str {
        "oracle"
    }

    fn update(
        &mut self,
        inputs: ArrayView4<'_, f32>,
        ground_truth: ArrayView4<'_, f32>,
        _learning_rate: f64,
        _training: bool,
    ) -> Result<(Array4<f32>, UpdateInfo)> {
        let (n, _, h, w) = inputs.dim();
        let pred = ground_truth.to_owned();
        let info = UpdateInfo {
            loss_l1: 0.0,
            loss_teacher: 0.0,
            loss_distill: 0.0,
            mask: Array4::zeros((n, 1, h, w)),
            mask_teacher: Array4::zeros((n, 1, h, w)),
            merged_teacher: pred.clone(),
            flow: Array4::zeros((n, FLOW_CHANNELS, h, w)),
            flow_teacher: Array4::zeros((n, FLOW_CHANNELS, h, w)),
        };
        Ok((pred, info))
    }

    fn inference(
        &mut self,
        img0: ArrayView4<'_, f32>,
        _img1: ArrayView4<'_, f32>,
    ) -> Result<Array4<f32>> {
        Ok(img0.to_owned())
    }

    fn save_model(&self, _dir: &Path, _rank: usize) -> Result<()> {
        Ok(())
    }

    fn load_model(&mut self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Batch whose pixel values all lie on the 8-bit grid.
fn grid_batch(first_id: usize, samples: usize, height: usize, width: usize) -> Batch {
    let data = Array4::from_shape_fn((samples, SAMPLE_CHANNELS, height, width), |(n, c, y, x)| {
        ((n * 37 + c * 11 + y * 5 + x * 3) % 256) as f32 / 255.0
    });
    let ids = (0..samples)
        .map(|i| format!("sample_{:03}", first_id + i))
        .collect();
    Batch { data, ids }
}

struct MemorySource {
    batches: Vec<Batch>,
}

impl BatchSource for MemorySource {
    fn steps_per_epoch(&self) -> u64 {
        self.batches.len() as u64
    }

    fn next_epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>>> {
        Box::new(self.batches.clone().into_iter().map(Ok))
    }
}

#[test]
fn perfect_predictions_score_infinite_psnr_and_unit_ssim() {
    let dir = tempdir().unwrap();
    let batches = vec![grid_batch(0, 4, 16, 16), grid_batch(4, 4, 16, 16)];
    let config = EvaluationConfig::default();
    let ctx = EvalContext {
        role: ProcessRole::single_process(),
        step: 10,
        eval_index: 1,
        output_root: dir.path(),
        config: &config,
    };
    let mut writer = MemorySummaryWriter::default();

    let report = evaluate(&mut Oracle, batches.into_iter().map(Ok), &ctx, &mut writer).unwrap();

    assert_eq!((report.batches, report.samples), (2, 8));
    assert_eq!(report.psnr, f64::INFINITY);
    assert_eq!(report.psnr_teacher, f64::INFINITY);
    assert_eq!(report.psnrr, f64::INFINITY);
    assert!((report.ssim - 1.0).abs() < 1e-9);
    assert!((report.ssim_weighted - 1.0).abs() < 1e-9);
    assert_eq!(report.loss_l1, 0.0);
    assert_eq!(report.loss_teacher, 0.0);
    assert_eq!(report.loss_distill, 0.0);

    assert_eq!(report.dumped_images, 8);
    for i in 0..8 {
        assert!(dir
            .path()
            .join(format!("sample_{i:03}"))
            .join(&config.dump.file_name)
            .exists());
    }
    assert_eq!(writer.scalars_for("ssim").len(), 1);
    assert_eq!(writer.scalars_for("psnr")[0].0, 10);
}

#[test]
fn perfect_off_grid_predictions_still_score_infinite_psnr() {
    let dir = tempdir().unwrap();
    let half = |ids: [&str; 4]| Batch {
        data: Array4::from_elem((4, SAMPLE_CHANNELS, 16, 16), 0.5),
        ids: ids.iter().map(|id| id.to_string()).collect(),
    };
    let batches = vec![half(["a", "b", "c", "d"]), half(["e", "f", "g", "h"])];
    let config = EvaluationConfig::default();
    let ctx = EvalContext {
        role: ProcessRole::single_process(),
        step: 2,
        eval_index: 1,
        output_root: dir.path(),
        config: &config,
    };

    let report = evaluate(
        &mut Oracle,
        batches.into_iter().map(Ok),
        &ctx,
        &mut MemorySummaryWriter::default(),
    )
    .unwrap();

    assert_eq!(report.psnr, f64::INFINITY);
    assert_eq!(report.psnr_teacher, f64::INFINITY);
    assert_eq!(report.psnrr, f64::INFINITY);
    assert!((report.ssim - 1.0).abs() < 1e-9);
}

fn write_gradient_case(root: &Path, id: &str, width: u32, height: u32) {
    let dir = root.join(id);
    fs::create_dir_all(&dir).unwrap();
    for (k, name) in ["frame1.png", "frame2.png", "frame3.png"].iter().enumerate() {
        let k = k as u32;
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                ((x * 3 + k * 40) % 256) as u8,
                ((y * 4 + k * 25) % 256) as u8,
                ((x + y + k * 60) % 256) as u8,
            ])
        })
        .save(dir.join(name))
        .unwrap();
    }
}

#[test]
fn benchmark_padding_matches_unpadded_scoring() {
    let dir = tempdir().unwrap();
    write_gradient_case(dir.path(), "clip", 70, 54);
    let dataset = TripletDataset::open(dir.path()).unwrap();
    let sample = &dataset.samples()[0];

    let params = BlendParams {
        weight: [0.3, 0.5, 0.7],
        bias: [0.01, 0.0, -0.02],
    };
    let case = benchmark_case(&mut BlendModel::from_params(params.clone()), sample).unwrap();
    assert_eq!((case.height, case.width), (54, 70));

    let packed = sample.load_packed().unwrap().insert_axis(Axis(0));
    let img0 = packed.slice(s![.., 0..3, .., ..]);
    let img1 = packed.slice(s![.., 3..6, .., ..]);
    let gt = packed.slice(s![.., 6..9, .., ..]);
    let pred = BlendModel::from_params(params)
        .inference(img0, img1)
        .unwrap()
        .mapv(|v| quantize_8bit(v.clamp(0.0, 1.0)));

    let expected_psnr = psnr(pred.view(), gt).unwrap();
    let expected_ssim = ssim_matlab(gt, pred.view(), 1.0).unwrap();
    assert!((case.psnr - expected_psnr).abs() < 1e-9);
    assert!((case.ssim - expected_ssim).abs() < 1e-9);
    assert!(case.psnr.is_finite());
}

#[test]
fn checkpoint_round_trip_reproduces_inference() {
    let dir = tempdir().unwrap();
    let batch = grid_batch(0, 2, 8, 12);
    let inputs = batch.inputs();
    let img0 = inputs.slice(s![.., 0..3, .., ..]);
    let img1 = inputs.slice(s![.., 3..6, .., ..]);

    let config = ModelConfig::default();
    let mut trained = build_model(&config, &SeedStreams::new(Seed(7))).unwrap();
    trained
        .update(batch.inputs(), batch.ground_truth(), 0.05, true)
        .unwrap();
    trained.save_model(dir.path(), 0).unwrap();
    let expected = trained.inference(img0, img1).unwrap();

    let mut restored = build_model(&config, &SeedStreams::new(Seed(99))).unwrap();
    assert_ne!(restored.inference(img0, img1).unwrap(), expected);
    restored.load_model(dir.path()).unwrap();
    assert_eq!(restored.inference(img0, img1).unwrap(), expected);
}

fn small_run_settings(root: &Path) -> TrainerSettings {
    let mut config = LabConfig::default();
    config.training = TrainingConfig {
        epochs: 4,
        batch_size: 2,
        eval_every_epochs: 2,
        scalar_every_steps: 2,
        progress_every_batches: 1,
        ..TrainingConfig::default()
    };
    config.schedule = ScheduleConfig {
        warmup_steps: 2,
        ..ScheduleConfig::default()
    };
    config.paths.checkpoint_dir = root.join("train_log");
    config.paths.output_root = root.join("outputs");
    TrainerSettings::from_config(&config)
}

#[test]
fn short_training_run_follows_cadences() {
    let dir = tempdir().unwrap();
    let settings = small_run_settings(dir.path());
    let mut model = BlendModel::from_params(BlendParams {
        weight: [0.5; 3],
        bias: [0.0; 3],
    });
    let mut train_data = MemorySource {
        batches: vec![
            grid_batch(0, 2, 8, 8),
            grid_batch(2, 2, 8, 8),
            grid_batch(4, 1, 8, 8),
        ],
    };
    let mut val_data = MemorySource {
        batches: vec![grid_batch(100, 2, 8, 8)],
    };
    let mut train_writer = MemorySummaryWriter::default();
    let mut validate_writer = MemorySummaryWriter::default();

    let outcome = {
        let mut trainer = Trainer::new(
            settings,
            ProcessRole::single_process(),
            &mut model,
            &mut train_data,
            &mut val_data,
            Summaries {
                train: &mut train_writer,
                validate: &mut validate_writer,
            },
        );
        let outcome = trainer.run().unwrap();
        assert_eq!(trainer.phase(), TrainPhase::Done);
        assert!(trainer.run().is_err());
        outcome
    };

    assert_eq!(outcome.steps_per_epoch, 3);
    assert_eq!(outcome.total_steps, 12);
    assert_eq!(outcome.state.global_step, 12);
    assert_eq!(outcome.state.eval_count, 4);
    assert_eq!(outcome.evaluations.len(), 2);

    let lr_steps: Vec<u64> = train_writer
        .scalars_for("learning_rate")
        .into_iter()
        .map(|(step, _)| step)
        .collect();
    assert_eq!(lr_steps, vec![1, 3, 5, 7, 9, 11]);
    assert_eq!(train_writer.scalars_for("loss/distill").len(), 6);

    let eval_steps: Vec<u64> = validate_writer
        .scalars_for("psnr")
        .into_iter()
        .map(|(step, _)| step)
        .collect();
    assert_eq!(eval_steps, vec![6, 12]);

    let checkpoint_dir = dir.path().join("train_log");
    assert!(checkpoint_dir.join(MANIFEST_FILE_NAME).exists());
    assert!(checkpoint_dir.join(blend::PARAMS_FILE_NAME).exists());
    assert!(dir.path().join("outputs/sample_100/interp.png").exists());
}

#[test]
fn secondary_rank_trains_without_side_outputs() {
    let dir = tempdir().unwrap();
    let settings = small_run_settings(dir.path());
    let mut model = BlendModel::from_params(BlendParams {
        weight: [0.5; 3],
        bias: [0.0; 3],
    });
    let mut train_data = MemorySource {
        batches: vec![grid_batch(0, 2, 8, 8)],
    };
    let mut val_data = MemorySource {
        batches: vec![grid_batch(100, 2, 8, 8)],
    };
    let mut train_writer = MemorySummaryWriter::default();
    let mut validate_writer = MemorySummaryWriter::default();

    let outcome = Trainer::new(
        settings,
        ProcessRole::from_rank(1),
        &mut model,
        &mut train_data,
        &mut val_data,
        Summaries {
            train: &mut train_writer,
            validate: &mut validate_writer,
        },
    )
    .run()
    .unwrap();

    assert_eq!(outcome.state.global_step, 4);
    assert_eq!(outcome.evaluations.len(), 2);
    assert!(train_writer.scalars.is_empty());
    assert!(validate_writer.scalars.is_empty());
    assert!(!dir.path().join("train_log").exists());
}
