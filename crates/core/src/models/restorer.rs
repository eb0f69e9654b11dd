//! ONNX face restoration (GFPGAN/CodeFormer style models).

use anyhow::{bail, Result};
use tracing::info;

use super::backend::SessionConfig;
use super::onnx::{ensure_model_file, hwc_to_nchw, nchw_to_hwc, OnnxModel};
use crate::collaborators::FaceRestorer;
use crate::resize::{resize, ResizeAlgorithm};
use crate::types::{Canvas, ModelOutput};

/// Square input side most face restoration models are exported with.
pub const FACE_INPUT_SIZE: usize = 512;

/// Restorer for models that take and return `[-1, 1]` RGB at a fixed
/// square size. The crop is resampled to that size on the way in; the
/// compositor's adapter resamples the result back to the crop.
pub struct OnnxFaceRestorer {
    model: OnnxModel,
    input_size: usize,
}

impl OnnxFaceRestorer {
    pub fn load(config: &SessionConfig<'_>) -> Result<Self> {
        Self::load_with_input_size(config, FACE_INPUT_SIZE)
    }

    pub fn load_with_input_size(config: &SessionConfig<'_>, input_size: usize) -> Result<Self> {
        if input_size == 0 {
            bail!("face restorer input size must be positive");
        }
        ensure_model_file(config.model_path)?;
        let model = OnnxModel::load(config)?;
        info!(
            model = %config.model_path.display(),
            backend = %config.backend,
            input_size,
            "Loaded face restorer"
        );
        Ok(Self { model, input_size })
    }
}

impl FaceRestorer for OnnxFaceRestorer {
    fn restore(&self, crop: &Canvas) -> Result<ModelOutput> {
        let square = resize(
            crop.pixels().view(),
            self.input_size,
            self.input_size,
            ResizeAlgorithm::Bilinear,
        );
        let input = hwc_to_nchw(square.view(), 2.0 / 255.0, -1.0);
        let output = self.model.run(input)?;
        Ok(ModelOutput::unit(nchw_to_hwc(output.view(), 0.5, 0.5)?))
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::models::backend::InferenceBackend;
    use crate::types::ValueRange;

    #[test]
    fn load_rejects_missing_model() {
        let config = SessionConfig {
            model_path: Path::new("/nonexistent/gfpgan.onnx"),
            backend: InferenceBackend::Cuda,
            trt_cache_dir: None,
        };
        assert!(OnnxFaceRestorer::load(&config).is_err());
        assert!(OnnxFaceRestorer::load_with_input_size(&config, 0).is_err());
    }

    /// Set `TILEFORGE_TEST_RESTORER` to a 512x512 face restoration model.
    #[test]
    #[ignore = "requires a GPU and an ONNX face restoration model"]
    fn onnx_restorer_returns_unit_range() {
        let model = PathBuf::from(std::env::var("TILEFORGE_TEST_RESTORER").unwrap());
        let config = SessionConfig {
            model_path: &model,
            backend: InferenceBackend::Cuda,
            trt_cache_dir: None,
        };
        let restorer = OnnxFaceRestorer::load(&config).unwrap();
        let crop = Canvas::filled(96, 120, 3, 128.0).unwrap();

        let output = restorer.restore(&crop).unwrap();
        assert_eq!(output.range, ValueRange::Unit);
        assert_eq!(output.pixels.dim(), (512, 512, 3));
    }
}
