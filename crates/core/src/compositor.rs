//! Second blending pass that swaps restored faces into the stitched canvas.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use ndarray::{s, Axis, Zip};
use serde::Serialize;
use tracing::{debug, warn};

use crate::adapt::conform_restoration;
use crate::collaborators::FaceRestorer;
use crate::mask::MaskCache;
use crate::types::{Canvas, FaceRegion};

/// Fraction of the larger box side added on every edge before cropping.
pub const FACE_PADDING: f32 = 0.30;
/// Feather ramp width as a fraction of the padded region's smaller side.
pub const FACE_FEATHER: f32 = 0.35;

/// Pixel window on the upscaled canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegionBounds {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRegion {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompositeReport {
    /// Indices into the detector's face list.
    pub restored: Vec<usize>,
    pub skipped: Vec<SkippedRegion>,
}

pub struct FaceCompositor {
    padding: f32,
    feather: f32,
    masks: Arc<MaskCache>,
}

impl FaceCompositor {
    pub fn new(masks: Arc<MaskCache>) -> Self {
        Self::with_settings(FACE_PADDING, FACE_FEATHER, masks)
    }

    pub fn with_settings(padding: f32, feather: f32, masks: Arc<MaskCache>) -> Self {
        Self {
            padding: padding.max(0.0),
            feather: feather.max(0.0),
            masks,
        }
    }

    /// Restore every face in turn and blend it back into `canvas`.
    ///
    /// `faces` are in base-canvas coordinates and are scaled by
    /// `upscale_factor`. A region whose crop, restoration or blend fails, or
    /// whose restorer panics, is left untouched and reported as skipped.
    pub fn composite(
        &self,
        canvas: &mut Canvas,
        faces: &[FaceRegion],
        upscale_factor: usize,
        restorer: &dyn FaceRestorer,
    ) -> CompositeReport {
        let mut report = CompositeReport::default();

        for (index, face) in faces.iter().enumerate() {
            let Some(bounds) = self.padded_bounds(
                face,
                upscale_factor,
                canvas.width(),
                canvas.height(),
            ) else {
                debug!(index, %face, "Face region lies outside the canvas");
                report.skipped.push(SkippedRegion {
                    index,
                    reason: "region lies outside the canvas".to_string(),
                });
                continue;
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.restore_region(canvas, bounds, restorer)
            }))
            .unwrap_or_else(|payload| {
                Err(anyhow!("face restorer panicked: {}", panic_message(&*payload)))
            });

            match outcome {
                Ok(()) => {
                    debug!(
                        index,
                        x = bounds.x,
                        y = bounds.y,
                        width = bounds.width,
                        height = bounds.height,
                        "Restored face region"
                    );
                    report.restored.push(index);
                }
                Err(error) => {
                    warn!(
                        index,
                        %face,
                        error = %format!("{error:#}"),
                        "Face restoration failed, keeping original pixels"
                    );
                    report.skipped.push(SkippedRegion {
                        index,
                        reason: format!("{error:#}"),
                    });
                }
            }
        }

        report
    }

    /// Scale `face` onto the upscaled canvas, pad it and clamp to bounds.
    /// Returns `None` when nothing of it remains inside the canvas.
    pub fn padded_bounds(
        &self,
        face: &FaceRegion,
        upscale_factor: usize,
        canvas_width: usize,
        canvas_height: usize,
    ) -> Option<RegionBounds> {
        let x = face.x as usize * upscale_factor;
        let y = face.y as usize * upscale_factor;
        let w = face.width as usize * upscale_factor;
        let h = face.height as usize * upscale_factor;
        let pad = (self.padding * w.max(h) as f32).round() as usize;

        let x0 = x.saturating_sub(pad);
        let y0 = y.saturating_sub(pad);
        let x1 = (x + w + pad).min(canvas_width);
        let y1 = (y + h + pad).min(canvas_height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(RegionBounds {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }

    fn restore_region(
        &self,
        canvas: &mut Canvas,
        bounds: RegionBounds,
        restorer: &dyn FaceRestorer,
    ) -> Result<()> {
        let crop = canvas.crop(bounds.x, bounds.y, bounds.width, bounds.height)?;
        let restored = conform_restoration(restorer.restore(&crop)?, &crop)?;

        let feather =
            (self.feather * bounds.width.min(bounds.height) as f32).round() as usize;
        let mask = self.masks.face(bounds.width, bounds.height, feather);

        let mut window = canvas.pixels_mut().slice_mut(s![
            bounds.y..bounds.y + bounds.height,
            bounds.x..bounds.x + bounds.width,
            ..
        ]);
        Zip::from(window.lanes_mut(Axis(2)))
            .and(restored.lanes(Axis(2)))
            .and(mask.view())
            .for_each(|mut original, restored, &m| {
                original.zip_mut_with(&restored, |o, &r| *o = r * m + *o * (1.0 - m));
            });
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
