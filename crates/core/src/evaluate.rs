//! Validation pass over a held-out split.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, ensure, Result};
use ndarray::{Array4, Axis};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::EvaluationConfig;
use crate::imaging::{flow_to_rgb, hconcat, save_png};
use crate::metrics::{mse, psnr, psnr_from_mse, quantize_8bit, ssim_matlab_per_sample};
use crate::model::InterpolationModel;
use crate::summary::SummaryWriter;
use crate::types::{Batch, ProcessRole};

/// Where and when one evaluation pass runs.
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    pub role: ProcessRole,
    /// Global training step; keys every summary of this pass.
    pub step: u64,
    /// 1-based index of this pass, for the image dump cadence.
    pub eval_index: u32,
    pub output_root: &'a Path,
    pub config: &'a EvaluationConfig,
}

/// Aggregates of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    pub batches: usize,
    pub samples: usize,
    /// Mean of per-sample PSNR.
    pub psnr: f64,
    pub psnr_teacher: f64,
    /// Sum of per-batch SSIM divided by the batch count.
    pub ssim: f64,
    /// Mean of per-sample SSIM.
    pub ssim_weighted: f64,
    /// Sum of per-batch PSNR divided by the batch count.
    pub psnrr: f64,
    pub loss_l1: f64,
    pub loss_teacher: f64,
    pub loss_distill: f64,
    pub dumped_images: usize,
}

#[derive(Default)]
struct Accumulator {
    batches: usize,
    loss_l1: Vec<f64>,
    loss_teacher: Vec<f64>,
    loss_distill: Vec<f64>,
    psnr: Vec<f64>,
    psnr_teacher: Vec<f64>,
    ssim_samples: Vec<f64>,
    ssim_batch_sum: f64,
    psnrr_sum: f64,
    dumped: usize,
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn clamp_unit(tensor: &Array4<f32>) -> Array4<f32> {
    tensor.mapv(|v| v.clamp(0.0, 1.0))
}

fn quantized(tensor: &Array4<f32>) -> Array4<f32> {
    tensor.mapv(|v| quantize_8bit(v.clamp(0.0, 1.0)))
}

/// Run the model over every batch without updating it.
///
/// Every sample's prediction is written to `<output_root>/<id>/<file_name>` when
/// the dump policy selects this pass. On the coordinator the first batch also
/// produces side-by-side comparisons (`<j>/img`) and flow renderings
/// (`<j>/flow`), and the final aggregates are emitted as scalars.
pub fn evaluate<I>(
    model: &mut dyn InterpolationModel,
    batches: I,
    ctx: &EvalContext<'_>,
    writer: &mut dyn SummaryWriter,
) -> Result<EvalReport>
where
    I: IntoIterator<Item = Result<Batch>>,
{
    info!(step = ctx.step, eval_index = ctx.eval_index, "Start evaluate");
    if !model.has_teacher() {
        info!(
            model = model.name(),
            "Model has no privileged path; psnr_teacher and distill loss mirror the prediction"
        );
    }
    let started = Instant::now();
    let dump = ctx.config.dump.dumps_on(ctx.eval_index);
    let mut acc = Accumulator::default();

    for (index, batch) in batches.into_iter().enumerate() {
        let batch = batch?;
        ensure!(
            batch.ids.len() == batch.len(),
            "validation batch {index} has {} ids for {} samples",
            batch.ids.len(),
            batch.len()
        );
        let gt = batch.ground_truth().to_owned();
        let (pred, info) = model.update(batch.inputs(), gt.view(), 0.0, false)?;

        acc.loss_l1.push(f64::from(info.loss_l1));
        acc.loss_teacher.push(f64::from(info.loss_teacher));
        acc.loss_distill.push(f64::from(info.loss_distill));

        let pred_q = quantized(&pred);
        let teacher_q = quantized(&info.merged_teacher);
        let gt_q = quantized(&gt);
        for (j, id) in batch.ids.iter().enumerate() {
            let gt_j = gt_q.index_axis(Axis(0), j);
            acc.psnr.push(psnr(pred_q.index_axis(Axis(0), j), gt_j)?);
            acc.psnr_teacher
                .push(psnr(teacher_q.index_axis(Axis(0), j), gt_j)?);

            let within_limit = ctx
                .config
                .dump
                .max_samples
                .is_none_or(|limit| acc.dumped < limit);
            if dump && within_limit {
                let path = dump_path(ctx.output_root, id, &ctx.config.dump.file_name);
                save_png(pred_q.index_axis(Axis(0), j), &path)?;
                acc.dumped += 1;
            }
        }

        acc.psnrr_sum += psnr_from_mse(mse(pred_q.view(), gt_q.view())?);

        let per_sample = ssim_matlab_per_sample(clamp_unit(&gt).view(), clamp_unit(&pred).view(), 1.0)?;
        acc.ssim_batch_sum += per_sample.iter().sum::<f64>() / per_sample.len() as f64;
        acc.ssim_samples.extend(per_sample);

        if index == 0 && ctx.role.is_coordinator {
            write_visuals(&pred, &info.merged_teacher, &info.flow, &gt, ctx, writer)?;
        }
        acc.batches += 1;
        debug!(batch = index, samples = batch.len(), "Validation batch done");
    }

    if acc.batches == 0 {
        bail!("validation set produced no batches");
    }

    let report = EvalReport {
        batches: acc.batches,
        samples: acc.psnr.len(),
        psnr: mean(&acc.psnr),
        psnr_teacher: mean(&acc.psnr_teacher),
        ssim: acc.ssim_batch_sum / acc.batches as f64,
        ssim_weighted: mean(&acc.ssim_samples),
        psnrr: acc.psnrr_sum / acc.batches as f64,
        loss_l1: mean(&acc.loss_l1),
        loss_teacher: mean(&acc.loss_teacher),
        loss_distill: mean(&acc.loss_distill),
        dumped_images: acc.dumped,
    };

    if !ctx.role.is_coordinator {
        return Ok(report);
    }

    writer.add_scalar("psnr", report.psnr, ctx.step)?;
    writer.add_scalar("psnr_teacher", report.psnr_teacher, ctx.step)?;
    writer.add_scalar("ssim", report.ssim, ctx.step)?;
    writer.add_scalar("psnrr", report.psnrr, ctx.step)?;
    writer.flush()?;

    info!(
        eval_index = ctx.eval_index,
        psnr = format!("{:.4}", report.psnr),
        psnr_teacher = format!("{:.4}", report.psnr_teacher),
        ssim = format!("{:.4}", report.ssim),
        psnrr = format!("{:.4}", report.psnrr),
        ssim_weighted = format!("{:.4}", report.ssim_weighted),
        elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
        "Validation finished"
    );
    Ok(report)
}

fn dump_path(output_root: &Path, sample_id: &str, file_name: &str) -> PathBuf {
    output_root.join(sample_id).join(file_name)
}

fn write_visuals(
    pred: &Array4<f32>,
    merged_teacher: &Array4<f32>,
    flow: &Array4<f32>,
    gt: &Array4<f32>,
    ctx: &EvalContext<'_>,
    writer: &mut dyn SummaryWriter,
) -> Result<()> {
    let pred = clamp_unit(pred);
    let merged = clamp_unit(merged_teacher);
    let gt = clamp_unit(gt);
    let batch = pred.shape()[0];

    for j in 0..ctx.config.visual_samples.min(batch) {
        let side_by_side = hconcat(&[
            merged.index_axis(Axis(0), j),
            pred.index_axis(Axis(0), j),
            gt.index_axis(Axis(0), j),
        ])?;
        writer.add_image(&format!("{j}/img"), side_by_side.view(), ctx.step)?;
    }

    for j in 0..ctx.config.flow_samples.min(flow.shape()[0]) {
        let field = flow.index_axis(Axis(0), j);
        let mut swapped = field.to_owned();
        swapped.invert_axis(Axis(0));
        let rgb = flow_to_rgb(swapped.view())?;
        writer.add_image(&format!("{j}/flow"), rgb.view(), ctx.step)?;
    }
    Ok(())
}
