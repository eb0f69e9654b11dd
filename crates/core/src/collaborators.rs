//! Interfaces to the models the pipeline drives.
//!
//! All calls are synchronous and may block for a long time on an
//! accelerator; the pipeline only ever invokes them from blocking tasks.

use anyhow::Result;

use crate::slicer::Block;
use crate::types::{Canvas, FaceRegion, ModelOutput};

/// Produces the base image the rest of the pipeline refines.
pub trait BaseGenerator: Send + Sync {
    fn generate(
        &self,
        prompt: &str,
        width: usize,
        height: usize,
        steps: u32,
        seed: u64,
    ) -> Result<Canvas>;
}

/// Locates faces on the base canvas, in base-canvas pixel coordinates.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, canvas: &Canvas) -> Result<Vec<FaceRegion>>;
}

/// Upscales one block by a fixed integer factor.
pub trait BlockUpscaler: Send + Sync {
    fn upscale(&self, block: &Block) -> Result<ModelOutput>;

    fn scale_factor(&self) -> usize;
}

pub trait FaceRestorer: Send + Sync {
    fn restore(&self, crop: &Canvas) -> Result<ModelOutput>;
}

/// Detector for pipelines without face handling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaces;

impl FaceDetector for NoFaces {
    fn detect(&self, _canvas: &Canvas) -> Result<Vec<FaceRegion>> {
        Ok(Vec::new())
    }
}

/// Detector that reports a fixed list of regions, e.g. supplied by the user.
#[derive(Debug, Default, Clone)]
pub struct FixedFaces {
    regions: Vec<FaceRegion>,
}

impl FixedFaces {
    pub fn new(regions: Vec<FaceRegion>) -> Self {
        Self { regions }
    }
}

impl FaceDetector for FixedFaces {
    fn detect(&self, canvas: &Canvas) -> Result<Vec<FaceRegion>> {
        let (width, height) = (canvas.width() as u32, canvas.height() as u32);
        Ok(self
            .regions
            .iter()
            .filter(|r| r.x < width && r.y < height)
            .copied()
            .collect())
    }
}
