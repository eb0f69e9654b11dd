//! Block upscalers: an ONNX super-resolution model and a plain resampler.

use anyhow::{bail, Result};
use tracing::info;

use super::backend::SessionConfig;
use super::onnx::{ensure_model_file, hwc_to_nchw, nchw_to_hwc, OnnxModel};
use crate::collaborators::BlockUpscaler;
use crate::resize::{resize, ResizeAlgorithm};
use crate::slicer::Block;
use crate::types::ModelOutput;

/// Super-resolution model run once per block.
///
/// Blocks are fed as `[1, 3, S, S]` in `[0, 1]` and the output is reported
/// in unit range; the stitcher conforms size, channels and range.
pub struct OnnxBlockUpscaler {
    model: OnnxModel,
    scale: usize,
}

impl OnnxBlockUpscaler {
    pub fn load(config: &SessionConfig<'_>, scale: usize) -> Result<Self> {
        if scale == 0 {
            bail!("upscale factor must be positive");
        }
        ensure_model_file(config.model_path)?;
        let model = OnnxModel::load(config)?;
        info!(
            model = %config.model_path.display(),
            backend = %config.backend,
            scale,
            fp16 = model.is_fp16(),
            "Loaded block upscaler"
        );
        Ok(Self { model, scale })
    }
}

impl BlockUpscaler for OnnxBlockUpscaler {
    fn upscale(&self, block: &Block) -> Result<ModelOutput> {
        let input = hwc_to_nchw(block.pixels.view(), 1.0 / 255.0, 0.0);
        let output = self.model.run(input)?;
        Ok(ModelOutput::unit(nchw_to_hwc(output.view(), 1.0, 0.0)?))
    }

    fn scale_factor(&self) -> usize {
        self.scale
    }
}

/// Interpolating upscaler for machines without a super-resolution model.
#[derive(Debug, Clone, Copy)]
pub struct ResampleUpscaler {
    scale: usize,
    algorithm: ResizeAlgorithm,
}

impl ResampleUpscaler {
    pub fn new(scale: usize, algorithm: ResizeAlgorithm) -> Self {
        Self {
            scale: scale.max(1),
            algorithm,
        }
    }
}

impl BlockUpscaler for ResampleUpscaler {
    fn upscale(&self, block: &Block) -> Result<ModelOutput> {
        let side = block.size() * self.scale;
        Ok(ModelOutput::byte(resize(
            block.pixels.view(),
            side,
            side,
            self.algorithm,
        )))
    }

    fn scale_factor(&self) -> usize {
        self.scale
    }
}
