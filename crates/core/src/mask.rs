//! Blend weight masks for block stitching and face compositing.
//!
//! Masks depend only on their size parameters, so [`MaskCache`] builds each
//! one once and hands out shared references to every block or region of the
//! same size.

use std::sync::Arc;

use dashmap::DashMap;
use ndarray::Array2;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MaskKey {
    Block { size: usize, ramp: usize },
    Face { width: usize, height: usize, feather: usize },
}

#[derive(Debug, Default)]
pub struct MaskCache {
    masks: DashMap<MaskKey, Arc<Array2<f32>>>,
}

impl MaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, size: usize, ramp: usize) -> Arc<Array2<f32>> {
        self.get_or_build(MaskKey::Block { size, ramp }, || feather_mask(size, ramp))
    }

    pub fn face(&self, width: usize, height: usize, feather: usize) -> Arc<Array2<f32>> {
        self.get_or_build(
            MaskKey::Face {
                width,
                height,
                feather,
            },
            || face_mask(width, height, feather),
        )
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    fn get_or_build(&self, key: MaskKey, build: impl FnOnce() -> Array2<f32>) -> Arc<Array2<f32>> {
        if let Some(mask) = self.masks.get(&key) {
            return Arc::clone(mask.value());
        }
        trace!(?key, "Building blend mask");
        let mask = Arc::new(build());
        Arc::clone(self.masks.entry(key).or_insert(mask).value())
    }
}

/// Square block mask: 1 in the interior, ramping linearly toward 0 across
/// the outer `ramp` pixels of each edge.
///
/// Ramp samples sit at pixel centers, `(k + 0.5) / ramp` for the `k`-th
/// pixel from the edge, so two ramps facing each other across a `ramp`-wide
/// band always sum to exactly 1 and no pixel ever gets zero weight.
pub fn feather_mask(size: usize, ramp: usize) -> Array2<f32> {
    let profile = edge_profile(size, ramp);
    Array2::from_shape_fn((size, size), |(y, x)| profile[y] * profile[x])
}

fn edge_profile(size: usize, ramp: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            if ramp == 0 {
                return 1.0;
            }
            let from_edge = i.min(size - 1 - i) as f32;
            ((from_edge + 0.5) / ramp as f32).min(1.0)
        })
        .collect()
}

/// Region mask for face compositing: a linear ramp over the outer `feather`
/// pixels, smoothed by a separable Gaussian so the restored patch has no
/// visible rectangle edge.
pub fn face_mask(width: usize, height: usize, feather: usize) -> Array2<f32> {
    let feather = feather.max(1) as f32;
    let ramp = Array2::from_shape_fn((height, width), |(y, x)| {
        let from_edge = x.min(width - 1 - x).min(y).min(height - 1 - y) as f32;
        (from_edge / feather).min(1.0)
    });

    let kernel = gaussian_kernel(feather / 4.0);
    gaussian_blur(&ramp, &kernel)
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let sigma = sigma.max(0.5);
    let radius = (sigma * 3.0).ceil() as isize;
    let mut taps: Vec<f32> = (-radius..=radius)
        .map(|offset| {
            let d = offset as f32;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = taps.iter().sum();
    for tap in &mut taps {
        *tap /= sum;
    }
    taps
}

/// Separable blur with clamped borders.
fn gaussian_blur(src: &Array2<f32>, taps: &[f32]) -> Array2<f32> {
    let (h, w) = src.dim();
    let radius = (taps.len() / 2) as isize;

    let mut horizontal = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, tap) in taps.iter().enumerate() {
                let sx = clamp_index(x as isize + k as isize - radius, w);
                acc += tap * src[[y, sx]];
            }
            horizontal[[y, x]] = acc;
        }
    }

    let mut out = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, tap) in taps.iter().enumerate() {
                let sy = clamp_index(y as isize + k as isize - radius, h);
                acc += tap * horizontal[[sy, x]];
            }
            out[[y, x]] = acc.clamp(0.0, 1.0);
        }
    }
    out
}

fn clamp_index(idx: isize, len: usize) -> usize {
    idx.clamp(0, len as isize - 1) as usize
}
