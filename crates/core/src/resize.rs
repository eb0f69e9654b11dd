//! Pure-Rust bilinear/nearest-neighbor resampling for HWC `f32` buffers.

use anyhow::Result;
use ndarray::{Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::types::Canvas;

/// Supported resize algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeAlgorithm {
    #[default]
    Bilinear,
    Nearest,
}

impl ResizeAlgorithm {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "nearest" | "neighbor" | "nn" => Self::Nearest,
            _ => Self::Bilinear,
        }
    }
}

/// Resample `src` to `dst_w x dst_h`, keeping the channel count.
///
/// Returns a copy when the size already matches.
pub fn resize(
    src: ArrayView3<'_, f32>,
    dst_w: usize,
    dst_h: usize,
    algorithm: ResizeAlgorithm,
) -> Array3<f32> {
    let (src_h, src_w, _) = src.dim();
    if src_h == dst_h && src_w == dst_w {
        return src.to_owned();
    }

    match algorithm {
        ResizeAlgorithm::Bilinear => resize_bilinear(src, dst_w, dst_h),
        ResizeAlgorithm::Nearest => resize_nearest(src, dst_w, dst_h),
    }
}

pub fn resize_canvas(
    canvas: &Canvas,
    dst_w: usize,
    dst_h: usize,
    algorithm: ResizeAlgorithm,
) -> Result<Canvas> {
    Canvas::new(resize(canvas.pixels().view(), dst_w, dst_h, algorithm))
}

pub(crate) fn resize_nearest(src: ArrayView3<'_, f32>, dst_w: usize, dst_h: usize) -> Array3<f32> {
    let (src_h, src_w, channels) = src.dim();
    let mut dst = Array3::<f32>::zeros((dst_h, dst_w, channels));

    for dst_y in 0..dst_h {
        let src_y = ((dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64) as usize;
        let src_y = src_y.min(src_h - 1);

        for dst_x in 0..dst_w {
            let src_x = ((dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64) as usize;
            let src_x = src_x.min(src_w - 1);

            for c in 0..channels {
                dst[[dst_y, dst_x, c]] = src[[src_y, src_x, c]];
            }
        }
    }

    dst
}

pub(crate) fn resize_bilinear(src: ArrayView3<'_, f32>, dst_w: usize, dst_h: usize) -> Array3<f32> {
    let (src_h, src_w, channels) = src.dim();
    let mut dst = Array3::<f32>::zeros((dst_h, dst_w, channels));

    for dst_y in 0..dst_h {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = (src_yf.floor().max(0.0) as usize).min(src_h - 1);
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0) as f32;

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = (src_xf.floor().max(0.0) as usize).min(src_w - 1);
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0) as f32;

            for c in 0..channels {
                let p00 = src[[src_y0, src_x0, c]];
                let p10 = src[[src_y0, src_x1, c]];
                let p01 = src[[src_y1, src_x0, c]];
                let p11 = src[[src_y1, src_x1, c]];

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                dst[[dst_y, dst_x, c]] = top * (1.0 - fy) + bot * fy;
            }
        }
    }

    dst
}
