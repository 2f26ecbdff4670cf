//! Frame tensor helpers: decoding, PNG output, alignment padding and flow colouring.
//!
//! Frames are CHW `f32` tensors in `[0, 1]`; batches are NCHW.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::RgbImage;
use ndarray::{concatenate, s, Array3, Array4, ArrayView3, ArrayView4, Axis};

/// Spatial dimensions must be multiples of this before inference.
pub const PAD_ALIGN: usize = 32;

pub fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - (dim % PAD_ALIGN)) % PAD_ALIGN
}

/// Rows/columns added around a frame, split as evenly as possible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Padding {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Padding {
    /// Symmetric padding that brings `height × width` up to [`PAD_ALIGN`].
    ///
    /// A 540-row frame gains 2 rows above and 2 below.
    pub fn to_alignment(height: usize, width: usize) -> Self {
        let pad_h = pad_amount(height);
        let pad_w = pad_amount(width);
        Self {
            top: pad_h / 2,
            bottom: pad_h - pad_h / 2,
            left: pad_w / 2,
            right: pad_w - pad_w / 2,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.top == 0 && self.bottom == 0 && self.left == 0 && self.right == 0
    }
}

/// Pad every sample by repeating its edge rows and columns.
pub fn replicate_pad(batch: ArrayView4<'_, f32>, padding: Padding) -> Array4<f32> {
    if padding.is_zero() {
        return batch.to_owned();
    }

    let (n, c, h, w) = batch.dim();
    let new_h = h + padding.top + padding.bottom;
    let new_w = w + padding.left + padding.right;
    Array4::from_shape_fn((n, c, new_h, new_w), |(b, ch, y, x)| {
        let src_y = y.saturating_sub(padding.top).min(h - 1);
        let src_x = x.saturating_sub(padding.left).min(w - 1);
        batch[[b, ch, src_y, src_x]]
    })
}

/// Remove `padding` from a padded batch.
pub fn crop(batch: ArrayView4<'_, f32>, padding: Padding) -> Result<Array4<f32>> {
    let (_, _, h, w) = batch.dim();
    if padding.top + padding.bottom >= h || padding.left + padding.right >= w {
        bail!(
            "cannot crop {:?} from a {}x{} tensor",
            padding,
            w,
            h
        );
    }
    Ok(batch
        .slice(s![
            ..,
            ..,
            padding.top..h - padding.bottom,
            padding.left..w - padding.right
        ])
        .to_owned())
}

/// Interleaved RGB8 → normalized CHW.
pub fn rgb8_to_chw(data: &[u8], width: u32, height: u32) -> Result<Array3<f32>> {
    let h = height as usize;
    let w = width as usize;
    let expected = h * w * 3;
    if data.len() != expected {
        bail!(
            "Data length mismatch: expected {} ({}x{}x3), got {}",
            expected,
            h,
            w,
            data.len()
        );
    }

    let hw = h * w;
    let mut chw = Array3::<f32>::zeros((3, h, w));
    let plane = chw
        .as_slice_mut()
        .context("freshly allocated frame must be contiguous")?;
    for (i, pixel) in data.chunks_exact(3).enumerate() {
        plane[i] = pixel[0] as f32 / 255.0;
        plane[hw + i] = pixel[1] as f32 / 255.0;
        plane[2 * hw + i] = pixel[2] as f32 / 255.0;
    }
    Ok(chw)
}

/// Normalized CHW → RGB8 image, rounding and clamping each sample.
pub fn chw_to_rgb8(frame: ArrayView3<'_, f32>) -> Result<RgbImage> {
    let (c, h, w) = frame.dim();
    if c != 3 {
        bail!("expected a 3-channel frame, got {c} channels");
    }

    let mut rgb = Vec::with_capacity(h * w * 3);
    for y in 0..h {
        for x in 0..w {
            for ch in 0..3 {
                rgb.push((frame[[ch, y, x]] * 255.0 + 0.5).clamp(0.0, 255.0) as u8);
            }
        }
    }
    RgbImage::from_raw(w as u32, h as u32, rgb)
        .context("RGB buffer does not match image dimensions")
}

/// Decode an image file into a normalized CHW frame.
pub fn load_frame(path: &Path) -> Result<Array3<f32>> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to decode image: {}", path.display()))?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    rgb8_to_chw(decoded.as_raw(), width, height)
}

/// Write a CHW frame as PNG, creating parent directories as needed.
pub fn save_png(frame: ArrayView3<'_, f32>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    let image = chw_to_rgb8(frame)?;
    image
        .save(path)
        .with_context(|| format!("failed to write image: {}", path.display()))
}

/// False-colour rendering of a 2-channel flow field.
///
/// Displacements are normalized by the largest magnitude component; red carries
/// +x, blue +y, and green drops with their sum. A zero field renders as the
/// neutral colour instead of dividing by zero.
pub fn flow_to_rgb(flow: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
    let (c, h, w) = flow.dim();
    if c != 2 {
        bail!("expected a 2-channel flow field, got {c} channels");
    }

    let max_abs = flow.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    let scale = if max_abs > 0.0 { 1.0 / max_abs } else { 0.0 };

    let mut rgb = Array3::<f32>::ones((3, h, w));
    for y in 0..h {
        for x in 0..w {
            let fx = flow[[0, y, x]] * scale;
            let fy = flow[[1, y, x]] * scale;
            rgb[[0, y, x]] += fx;
            rgb[[1, y, x]] -= 0.5 * (fx + fy);
            rgb[[2, y, x]] += fy;
        }
    }
    rgb.mapv_inplace(|v| v.clamp(0.0, 1.0));
    Ok(rgb)
}

/// Concatenate equally tall CHW frames left to right.
pub fn hconcat(frames: &[ArrayView3<'_, f32>]) -> Result<Array3<f32>> {
    if frames.is_empty() {
        bail!("nothing to concatenate");
    }
    concatenate(Axis(2), frames).context("frames differ in channel count or height")
}
