//! Standalone quality benchmark of a trained model over frame triplets.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use ndarray::{s, Array4, Axis};
use serde::Serialize;
use tracing::info;

use crate::dataset::{TripletDataset, TripletSample};
use crate::imaging::{crop, replicate_pad, Padding};
use crate::metrics::{psnr, quantize_8bit, ssim_matlab};
use crate::model::InterpolationModel;
use crate::types::FRAME_CHANNELS;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkCase {
    pub id: String,
    pub height: usize,
    pub width: usize,
    pub psnr: f64,
    pub ssim: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub root: PathBuf,
    pub model: String,
    pub generated_at: String,
    pub mean_psnr: f64,
    pub mean_ssim: f64,
    pub cases: Vec<BenchmarkCase>,
}

/// Interpolate one triplet and score the prediction against its middle frame.
///
/// Inputs are replicate-padded up to the network alignment and the prediction
/// is cropped back before scoring. Both metrics see the prediction snapped to
/// 8-bit levels.
pub fn benchmark_case(
    model: &mut dyn InterpolationModel,
    sample: &TripletSample,
) -> Result<BenchmarkCase> {
    let packed = sample.load_packed()?.insert_axis(Axis(0));
    let (_, _, height, width) = packed.dim();
    let img0 = packed.slice(s![.., 0..FRAME_CHANNELS, .., ..]);
    let img1 = packed.slice(s![.., FRAME_CHANNELS..2 * FRAME_CHANNELS, .., ..]);
    let gt = packed.slice(s![.., 2 * FRAME_CHANNELS.., .., ..]);

    let padding = Padding::to_alignment(height, width);
    let padded0 = replicate_pad(img0, padding);
    let padded1 = replicate_pad(img1, padding);
    let pred = model
        .inference(padded0.view(), padded1.view())
        .with_context(|| format!("inference failed for case '{}'", sample.id))?;
    let pred = crop(pred.view(), padding)?;
    ensure!(
        pred.dim() == gt.dim(),
        "prediction for '{}' has shape {:?}, expected {:?}",
        sample.id,
        pred.shape(),
        gt.shape()
    );

    let pred_q: Array4<f32> = pred.mapv(|v| quantize_8bit(v.clamp(0.0, 1.0)));
    Ok(BenchmarkCase {
        id: sample.id.clone(),
        height,
        width,
        psnr: psnr(pred_q.view(), gt)?,
        ssim: ssim_matlab(gt, pred_q.view(), 1.0)?,
    })
}

/// Score every complete triplet under `root`, in directory-name order.
pub fn run_benchmark(model: &mut dyn InterpolationModel, root: &Path) -> Result<BenchmarkReport> {
    let dataset = TripletDataset::open(root)?;
    ensure!(
        !dataset.is_empty(),
        "no frame triplets found under {}",
        root.display()
    );
    info!(cases = dataset.len(), model = model.name(), "Benchmark starting");

    let started = Instant::now();
    let mut cases = Vec::with_capacity(dataset.len());
    let mut psnr_sum = 0.0;
    let mut ssim_sum = 0.0;
    for sample in dataset.samples() {
        let case = benchmark_case(model, sample)?;
        psnr_sum += case.psnr;
        ssim_sum += case.ssim;
        cases.push(case);
        let n = cases.len() as f64;
        info!("Avg PSNR: {} SSIM: {}", psnr_sum / n, ssim_sum / n);
    }

    let n = cases.len() as f64;
    let report = BenchmarkReport {
        root: root.to_path_buf(),
        model: model.name().to_string(),
        generated_at: chrono::Utc::now().to_rfc3339(),
        mean_psnr: psnr_sum / n,
        mean_ssim: ssim_sum / n,
        cases,
    };
    info!(
        cases = report.cases.len(),
        mean_psnr = format!("{:.4}", report.mean_psnr),
        mean_ssim = format!("{:.4}", report.mean_ssim),
        elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
        "Benchmark finished"
    );
    Ok(report)
}

pub fn write_report(report: &BenchmarkReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
    }
    let encoded =
        serde_json::to_string_pretty(report).context("Failed to serialize benchmark report")?;
    fs::write(path, encoded)
        .with_context(|| format!("Failed to write benchmark report: {}", path.display()))?;
    info!(path = %path.display(), "Benchmark report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::blend::{BlendModel, BlendParams};
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn write_case(root: &Path, id: &str, width: u32, height: u32, values: [u8; 3]) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        for (name, value) in ["frame1.png", "frame2.png", "frame3.jpg"].iter().zip(values) {
            RgbImage::from_pixel(width, height, Rgb([value, value, value]))
                .save(dir.join(name))
                .unwrap();
        }
    }

    fn copy_first_input() -> BlendModel {
        BlendModel::from_params(BlendParams {
            weight: [1.0; 3],
            bias: [0.0; 3],
        })
    }

    #[test]
    fn identical_frames_score_perfectly() {
        let dir = tempdir().unwrap();
        write_case(dir.path(), "case_a", 40, 27, [90, 90, 90]);
        let dataset = TripletDataset::open(dir.path()).unwrap();

        let case = benchmark_case(&mut copy_first_input(), &dataset.samples()[0]).unwrap();
        assert_eq!((case.height, case.width), (27, 40));
        assert_eq!(case.psnr, f64::INFINITY);
        assert!((case.ssim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn report_averages_cases_and_serializes() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("test_2k_540p");
        write_case(&root, "b", 32, 32, [0, 0, 0]);
        write_case(&root, "a", 32, 32, [50, 50, 50]);

        let report = run_benchmark(&mut copy_first_input(), &root).unwrap();
        let ids: Vec<_> = report.cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(report.mean_psnr, f64::INFINITY);

        let path = dir.path().join("reports/bench.json");
        write_report(&report, &path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["model"], "blend");
        assert_eq!(value["cases"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn empty_root_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(run_benchmark(&mut copy_first_input(), dir.path()).is_err());
    }
}
