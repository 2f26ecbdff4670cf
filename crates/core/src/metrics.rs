//! Image quality metrics: PSNR and SSIM over NCHW tensors.
//!
//! PSNR of two identical tensors is `f64::INFINITY`: the MSE is zero and the
//! logarithm diverges. Callers averaging PSNR values will see the mean become
//! infinite as well, which is the intended report for a perfect reconstruction.

use anyhow::{ensure, Result};
use ndarray::{Array3, ArrayView, ArrayView3, ArrayView4, Axis, Dimension, Slice};

pub const SSIM_WINDOW_SIZE: usize = 11;
pub const SSIM_SIGMA: f64 = 1.5;
const SSIM_K1: f64 = 0.01;
const SSIM_K2: f64 = 0.03;

/// Mean squared error over every element.
pub fn mse<D: Dimension>(a: ArrayView<'_, f32, D>, b: ArrayView<'_, f32, D>) -> Result<f64> {
    ensure!(
        a.shape() == b.shape(),
        "metric inputs differ in shape: {:?} vs {:?}",
        a.shape(),
        b.shape()
    );
    ensure!(!a.is_empty(), "metric inputs are empty");

    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    Ok(sum / a.len() as f64)
}

/// `-10 * log10(mse)`; `+inf` when `mse == 0`.
pub fn psnr_from_mse(mse: f64) -> f64 {
    if mse <= 0.0 {
        return f64::INFINITY;
    }
    -10.0 * mse.log10()
}

/// Peak signal-to-noise ratio for tensors on a unit peak scale.
pub fn psnr<D: Dimension>(a: ArrayView<'_, f32, D>, b: ArrayView<'_, f32, D>) -> Result<f64> {
    Ok(psnr_from_mse(mse(a, b)?))
}

/// Snap values to the nearest 8-bit level: `round(x * 255) / 255`.
///
/// Ties round to even, matching how the deployment target quantizes output.
pub fn quantize_8bit(value: f32) -> f32 {
    (value * 255.0).round_ties_even() / 255.0
}

/// Single-scale SSIM with an 11×11 Gaussian window applied per channel.
///
/// The window shrinks to `min(11, H, W)` for small frames; no padding is applied,
/// so the map covers only fully-overlapped positions. Returns the mean over the
/// whole batch.
pub fn ssim(a: ArrayView4<'_, f32>, b: ArrayView4<'_, f32>, value_range: f64) -> Result<f64> {
    check_ssim_inputs(&a, &b)?;
    let (height, width) = (a.shape()[2], a.shape()[3]);
    let kernel = gaussian_kernel(SSIM_WINDOW_SIZE.min(height).min(width), SSIM_SIGMA);
    let constants = SsimConstants::for_range(value_range);

    let mut sum = 0.0;
    let mut count = 0usize;
    for (sample_a, sample_b) in a.outer_iter().zip(b.outer_iter()) {
        for (plane_a, plane_b) in sample_a.outer_iter().zip(sample_b.outer_iter()) {
            let x = plane_a.insert_axis(Axis(0)).mapv(f64::from);
            let y = plane_b.insert_axis(Axis(0)).mapv(f64::from);
            let (map_sum, map_len) = ssim_map_sum(&x, &y, &kernel, &[1, 2], constants);
            sum += map_sum;
            count += map_len;
        }
    }
    Ok(sum / count as f64)
}

/// Matlab-compatible SSIM, one value per sample.
///
/// Uses a volumetric Gaussian window (11 taps along channel, height and width)
/// over replicate-padded input, so every pixel of every channel contributes one
/// map entry.
pub fn ssim_matlab_per_sample(
    a: ArrayView4<'_, f32>,
    b: ArrayView4<'_, f32>,
    value_range: f64,
) -> Result<Vec<f64>> {
    check_ssim_inputs(&a, &b)?;
    let (height, width) = (a.shape()[2], a.shape()[3]);
    let kernel = gaussian_kernel(SSIM_WINDOW_SIZE.min(height).min(width), SSIM_SIGMA);
    let constants = SsimConstants::for_range(value_range);
    let pad = SSIM_WINDOW_SIZE / 2;

    Ok(a.outer_iter()
        .zip(b.outer_iter())
        .map(|(sample_a, sample_b)| {
            let x = replicate_pad3(sample_a, pad);
            let y = replicate_pad3(sample_b, pad);
            let (map_sum, map_len) = ssim_map_sum(&x, &y, &kernel, &[0, 1, 2], constants);
            map_sum / map_len as f64
        })
        .collect())
}

/// Matlab-compatible SSIM averaged over the batch.
pub fn ssim_matlab(a: ArrayView4<'_, f32>, b: ArrayView4<'_, f32>, value_range: f64) -> Result<f64> {
    let per_sample = ssim_matlab_per_sample(a, b, value_range)?;
    Ok(per_sample.iter().sum::<f64>() / per_sample.len() as f64)
}

#[derive(Debug, Clone, Copy)]
struct SsimConstants {
    c1: f64,
    c2: f64,
}

impl SsimConstants {
    fn for_range(value_range: f64) -> Self {
        Self {
            c1: (SSIM_K1 * value_range).powi(2),
            c2: (SSIM_K2 * value_range).powi(2),
        }
    }
}

fn check_ssim_inputs(a: &ArrayView4<'_, f32>, b: &ArrayView4<'_, f32>) -> Result<()> {
    ensure!(
        a.shape() == b.shape(),
        "SSIM inputs differ in shape: {:?} vs {:?}",
        a.shape(),
        b.shape()
    );
    ensure!(
        a.shape().iter().all(|&dim| dim > 0),
        "SSIM inputs must be non-empty, got shape {:?}",
        a.shape()
    );
    Ok(())
}

pub(crate) fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f64> {
    let center = (size / 2) as f64;
    let raw: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|v| v / total).collect()
}

fn ssim_map_sum(
    x: &Array3<f64>,
    y: &Array3<f64>,
    kernel: &[f64],
    axes: &[usize],
    constants: SsimConstants,
) -> (f64, usize) {
    let blur = |input: &Array3<f64>| {
        axes.iter()
            .fold(input.clone(), |acc, &axis| filter_axis(&acc, kernel, axis))
    };

    let mu_x = blur(x);
    let mu_y = blur(y);
    let xx = blur(&(x * x));
    let yy = blur(&(y * y));
    let xy = blur(&(x * y));

    let mut sum = 0.0;
    ndarray::Zip::from(&mu_x)
        .and(&mu_y)
        .and(&xx)
        .and(&yy)
        .and(&xy)
        .for_each(|&mx, &my, &sxx, &syy, &sxy| {
            let sigma_x = sxx - mx * mx;
            let sigma_y = syy - my * my;
            let sigma_xy = sxy - mx * my;
            let numerator = (2.0 * mx * my + constants.c1) * (2.0 * sigma_xy + constants.c2);
            let denominator =
                (mx * mx + my * my + constants.c1) * (sigma_x + sigma_y + constants.c2);
            sum += numerator / denominator;
        });

    (sum, mu_x.len())
}

/// Valid-mode 1-D correlation along `axis`.
fn filter_axis(input: &Array3<f64>, kernel: &[f64], axis: usize) -> Array3<f64> {
    let out_len = input.shape()[axis] + 1 - kernel.len();
    let mut shape = input.raw_dim();
    shape[axis] = out_len;

    let mut out = Array3::<f64>::zeros(shape);
    for (offset, &weight) in kernel.iter().enumerate() {
        let window = input.slice_axis(Axis(axis), Slice::from(offset..offset + out_len));
        out.scaled_add(weight, &window);
    }
    out
}

fn replicate_pad3(input: ArrayView3<'_, f32>, pad: usize) -> Array3<f64> {
    let (c, h, w) = input.dim();
    let clamp = |index: usize, len: usize| index.saturating_sub(pad).min(len - 1);
    Array3::from_shape_fn((c + 2 * pad, h + 2 * pad, w + 2 * pad), |(i, j, k)| {
        f64::from(input[[clamp(i, c), clamp(j, h), clamp(k, w)]])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn gradient_frame(n: usize, c: usize, h: usize, w: usize, phase: f32) -> Array4<f32> {
        Array4::from_shape_fn((n, c, h, w), |(b, ch, y, x)| {
            let v = ((x as f32 * 0.37 + y as f32 * 0.11 + ch as f32 * 0.5 + b as f32 + phase)
                .sin()
                + 1.0)
                * 0.5;
            v.clamp(0.0, 1.0)
        })
    }

    #[test]
    fn psnr_of_identical_frames_is_infinite() {
        let a = gradient_frame(1, 3, 16, 16, 0.0);
        let value = psnr(a.view(), a.view()).unwrap();
        assert!(value.is_infinite() && value > 0.0);
    }

    #[test]
    fn psnr_is_symmetric() {
        let a = gradient_frame(2, 3, 16, 24, 0.0);
        let b = gradient_frame(2, 3, 16, 24, 0.4);
        let ab = psnr(a.view(), b.view()).unwrap();
        let ba = psnr(b.view(), a.view()).unwrap();
        assert!((ab - ba).abs() < 1e-12);
    }

    #[test]
    fn psnr_decreases_as_error_grows() {
        let a = Array4::<f32>::from_elem((1, 3, 8, 8), 0.5);
        let near = a.mapv(|v| v + 0.01);
        let far = a.mapv(|v| v + 0.1);
        let psnr_near = psnr(a.view(), near.view()).unwrap();
        let psnr_far = psnr(a.view(), far.view()).unwrap();
        assert!(psnr_near > psnr_far);
        assert!((psnr_far - 20.0).abs() < 1e-3);
    }

    #[test]
    fn psnr_rejects_shape_mismatch() {
        let a = Array4::<f32>::zeros((1, 3, 8, 8));
        let b = Array4::<f32>::zeros((1, 3, 8, 9));
        let err = psnr(a.view(), b.view()).unwrap_err();
        assert!(err.to_string().contains("differ in shape"));
    }

    #[test]
    fn quantize_snaps_to_8bit_levels() {
        assert_eq!(quantize_8bit(0.0), 0.0);
        assert_eq!(quantize_8bit(1.0), 1.0);
        assert_eq!(quantize_8bit(0.5), 128.0 / 255.0);
        let level = 77.0 / 255.0;
        assert_eq!(quantize_8bit(level), level);
    }

    #[test]
    fn gaussian_kernel_is_normalized_and_symmetric() {
        let kernel = gaussian_kernel(11, 1.5);
        assert_eq!(kernel.len(), 11);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((kernel[0] - kernel[10]).abs() < 1e-15);
        assert!(kernel[5] > kernel[4]);
    }

    #[test]
    fn ssim_of_identical_frames_is_one() {
        let a = gradient_frame(2, 3, 20, 24, 0.0);
        let planar = ssim(a.view(), a.view(), 1.0).unwrap();
        let volumetric = ssim_matlab(a.view(), a.view(), 1.0).unwrap();
        assert!((planar - 1.0).abs() < 1e-9);
        assert!((volumetric - 1.0).abs() < 1e-9);
    }

    #[test]
    fn ssim_is_bounded_for_dissimilar_frames() {
        let a = gradient_frame(1, 3, 24, 24, 0.0);
        let b = gradient_frame(1, 3, 24, 24, 2.0);
        let noise = Array4::from_shape_fn((1, 3, 24, 24), |(_, c, y, x)| {
            ((x * 7 + y * 13 + c * 3) % 11) as f32 / 10.0
        });
        for other in [&b, &noise] {
            let planar = ssim(a.view(), other.view(), 1.0).unwrap();
            let volumetric = ssim_matlab(a.view(), other.view(), 1.0).unwrap();
            assert!(planar <= 1.0 + 1e-9 && planar >= -1.0 - 1e-9);
            assert!(volumetric <= 1.0 + 1e-9 && volumetric >= -1.0 - 1e-9);
            assert!(volumetric < 0.999);
        }
    }

    #[test]
    fn ssim_handles_frames_smaller_than_window() {
        let a = gradient_frame(1, 3, 5, 7, 0.0);
        let b = gradient_frame(1, 3, 5, 7, 0.3);
        let planar = ssim(a.view(), b.view(), 1.0).unwrap();
        let volumetric = ssim_matlab(a.view(), b.view(), 1.0).unwrap();
        assert!(planar.is_finite());
        assert!(volumetric.is_finite());
    }

    #[test]
    fn ssim_matlab_per_sample_matches_batch_mean() {
        let a = gradient_frame(3, 3, 16, 16, 0.0);
        let b = gradient_frame(3, 3, 16, 16, 0.2);
        let per_sample = ssim_matlab_per_sample(a.view(), b.view(), 1.0).unwrap();
        assert_eq!(per_sample.len(), 3);
        let mean = per_sample.iter().sum::<f64>() / 3.0;
        let batch = ssim_matlab(a.view(), b.view(), 1.0).unwrap();
        assert!((mean - batch).abs() < 1e-12);
    }

    #[test]
    fn ssim_constants_scale_with_range() {
        let unit = SsimConstants::for_range(1.0);
        let byte = SsimConstants::for_range(255.0);
        assert!((unit.c1 - 1e-4).abs() < 1e-15);
        assert!((unit.c2 - 9e-4).abs() < 1e-15);
        assert!((byte.c1 - 6.5025).abs() < 1e-9);
    }
}
