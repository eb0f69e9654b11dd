//! Shared ONNX session wrapper and NCHW tensor layout helpers.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array3, Array4, ArrayD, ArrayView3, ArrayViewD, Axis, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use super::backend::{build_session, SessionConfig};

/// One loaded model with a single RGB input and a single output.
///
/// Runs are serialized through the session mutex.
pub struct OnnxModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OnnxModel {
    pub fn load(config: &SessionConfig<'_>) -> Result<Self> {
        let session = build_session(config)?;

        let input = session
            .inputs()
            .first()
            .context("model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("model declares no outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(
            model = %config.model_path.display(),
            %input_name, %output_name, is_fp16,
            "Detected model IO"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    /// Run the model on an `f32` NCHW tensor; FP16 models are fed and read
    /// back through half-precision buffers.
    pub fn run(&self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;
        if self.is_fp16 {
            return run_fp16(&mut session, &input, &self.input_name, &self.output_name);
        }

        let input_tensor = Tensor::from_array(input)?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned())
    }
}

fn run_fp16(
    session: &mut Session,
    input: &Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let standard = input.as_standard_layout();
    let f32_slice = standard
        .as_slice()
        .context("input tensor is not contiguous")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
    let input_tensor = Tensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let fp16_owned = output_view.as_standard_layout().into_owned();
    let fp16_slice = fp16_owned
        .as_slice()
        .context("output tensor is not contiguous")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ArrayD::from_shape_vec(fp16_owned.shape().to_vec(), f32_data)?)
}

/// HWC samples to a `[1, 3, H, W]` tensor with `v * scale + offset` applied.
///
/// Images with fewer than three channels replicate their first channel;
/// channels past the third (alpha) are ignored.
pub fn hwc_to_nchw(pixels: ArrayView3<'_, f32>, scale: f32, offset: f32) -> Array4<f32> {
    let (h, w, channels) = pixels.dim();
    let mut nchw = Array4::<f32>::zeros((1, 3, h, w));
    for c in 0..3 {
        let src = if channels >= 3 { c } else { 0 };
        nchw.slice_mut(s![0, c, .., ..])
            .assign(&pixels.index_axis(Axis(2), src).mapv(|v| v * scale + offset));
    }
    nchw
}

/// `[1, C, H, W]` model output to HWC with `v * scale + offset` applied.
pub fn nchw_to_hwc(output: ArrayViewD<'_, f32>, scale: f32, offset: f32) -> Result<Array3<f32>> {
    let output = output
        .into_dimensionality::<Ix4>()
        .context("model output must be a rank-4 NCHW tensor")?;
    let (batch, channels, h, w) = output.dim();
    if batch != 1 || channels == 0 || h == 0 || w == 0 {
        bail!("unexpected model output shape [{batch}, {channels}, {h}, {w}]");
    }
    Ok(output
        .index_axis(Axis(0), 0)
        .permuted_axes([1, 2, 0])
        .mapv(|v| v * scale + offset))
}

/// Path check shared by the model constructors.
pub(crate) fn ensure_model_file(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("model file not found: {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwc_to_nchw_deinterleaves_and_scales() {
        let mut pixels = Array3::<f32>::zeros((2, 3, 3));
        pixels[[1, 2, 0]] = 255.0;
        pixels[[0, 1, 2]] = 51.0;

        let nchw = hwc_to_nchw(pixels.view(), 1.0 / 255.0, 0.0);
        assert_eq!(nchw.dim(), (1, 3, 2, 3));
        assert!((nchw[[0, 0, 1, 2]] - 1.0).abs() < 1e-6);
        assert!((nchw[[0, 2, 0, 1]] - 0.2).abs() < 1e-6);
        assert_eq!(nchw[[0, 1, 1, 2]], 0.0);
    }

    #[test]
    fn gray_input_is_replicated() {
        let pixels = Array3::from_elem((2, 2, 1), 255.0);
        let nchw = hwc_to_nchw(pixels.view(), 2.0 / 255.0, -1.0);
        assert!(nchw.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn nchw_to_hwc_transposes() {
        let mut output = Array4::<f32>::zeros((1, 3, 2, 4));
        output[[0, 1, 1, 3]] = -1.0;
        output[[0, 2, 0, 0]] = 1.0;

        let hwc = nchw_to_hwc(output.view().into_dyn(), 0.5, 0.5).unwrap();
        assert_eq!(hwc.dim(), (2, 4, 3));
        assert_eq!(hwc[[1, 3, 1]], 0.0);
        assert_eq!(hwc[[0, 0, 2]], 1.0);
        assert_eq!(hwc[[0, 0, 0]], 0.5);
    }

    #[test]
    fn nchw_to_hwc_rejects_other_ranks() {
        let flat = ArrayD::<f32>::zeros(ndarray::IxDyn(&[3, 4]));
        assert!(nchw_to_hwc(flat.view(), 1.0, 0.0).is_err());
        let batched = ArrayD::<f32>::zeros(ndarray::IxDyn(&[2, 3, 4, 4]));
        assert!(nchw_to_hwc(batched.view(), 1.0, 0.0).is_err());
    }

    #[test]
    fn missing_model_file_is_reported() {
        let err = ensure_model_file(Path::new("/nonexistent/model.onnx")).expect_err("missing");
        assert!(err.to_string().contains("model file not found"));
    }
}
