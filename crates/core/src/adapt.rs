//! Boundary adapters for external model outputs.
//!
//! Models may answer in `[0, 1]` or `[0, 255]`, with a different channel
//! count, or at a slightly different size than asked. Each boundary gets one
//! function here that turns a [`ModelOutput`] into exactly what its consumer
//! blends with; nothing downstream re-checks shape or range.

use anyhow::Result;
use ndarray::{s, Array3, Axis};
use tracing::trace;

use crate::error::PipelineError;
use crate::resize::{resize, ResizeAlgorithm};
use crate::types::{Canvas, ModelOutput};

/// Upscaler boundary: a square `expected_size` block with `channels`
/// channels in byte range.
pub fn conform_block(
    output: ModelOutput,
    expected_size: usize,
    channels: usize,
) -> Result<Array3<f32>> {
    conform(output, expected_size, expected_size, channels)
}

/// Restorer boundary: same size and channel count as the crop that was
/// handed to the restorer.
pub fn conform_restoration(output: ModelOutput, crop: &Canvas) -> Result<Array3<f32>> {
    conform(output, crop.width(), crop.height(), crop.channels())
}

fn conform(output: ModelOutput, width: usize, height: usize, channels: usize) -> Result<Array3<f32>> {
    let (out_h, out_w, out_c) = output.pixels.dim();
    if out_h == 0 || out_w == 0 || out_c == 0 {
        return Err(PipelineError::InvalidGeometry(format!(
            "model returned an empty {out_w}x{out_h}x{out_c} buffer"
        ))
        .into());
    }

    let factor = output.range.to_byte_factor();
    let mut pixels = output.pixels;
    pixels.mapv_inplace(|v| (v * factor).clamp(0.0, 255.0));

    let pixels = match_channels(pixels, channels);

    if out_w != width || out_h != height {
        trace!(
            from_width = out_w,
            from_height = out_h,
            to_width = width,
            to_height = height,
            "Resampling model output"
        );
        return Ok(resize(pixels.view(), width, height, ResizeAlgorithm::Bilinear));
    }
    Ok(pixels)
}

/// Convert between channel layouts.
///
/// Gray expands into the color channels, color collapses to gray by mean,
/// surplus channels are dropped and missing extra channels (alpha) are
/// filled opaque.
fn match_channels(pixels: Array3<f32>, channels: usize) -> Array3<f32> {
    let (h, w, src_c) = pixels.dim();
    if src_c == channels {
        return pixels;
    }

    if channels == 1 {
        let color = src_c.min(3);
        return pixels
            .slice(s![.., .., ..color])
            .mean_axis(Axis(2))
            .map(|gray| gray.insert_axis(Axis(2)))
            .unwrap_or_else(|| Array3::zeros((h, w, 1)));
    }

    let mut out = Array3::<f32>::from_elem((h, w, channels), 255.0);
    if src_c == 1 {
        let plane = pixels.index_axis(Axis(2), 0);
        for c in 0..channels.min(3) {
            out.index_axis_mut(Axis(2), c).assign(&plane);
        }
    } else {
        let shared = src_c.min(channels);
        out.slice_mut(s![.., .., ..shared])
            .assign(&pixels.slice(s![.., .., ..shared]));
    }
    out
}
