//! Core crate for the tiled upscale-and-reconstruct pipeline.

pub mod adapt;
pub mod collaborators;
pub mod compositor;
pub mod config;
pub mod error;
pub mod logging;
pub mod mask;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod processor;
pub mod resize;
pub mod slicer;
pub mod stitcher;
pub mod types;

pub use error::PipelineError;
pub use orchestrator::{Collaborators, Orchestrator, RenderRequest, SharedResources};
pub use types::{Canvas, PipelineReport, PipelineResult};
