//! Model-backed implementations of the pipeline collaborators.

pub mod backend;
pub mod onnx;
pub mod restorer;
pub mod upscaler;

pub use backend::{build_session, InferenceBackend, SessionConfig};
pub use restorer::OnnxFaceRestorer;
pub use upscaler::{OnnxBlockUpscaler, ResampleUpscaler};
