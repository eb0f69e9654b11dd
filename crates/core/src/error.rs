//! Error taxonomy for the upscale pipeline.
//!
//! Everything returns `anyhow::Result`; a [`PipelineError`] is attached as
//! context at the boundary where a failure is classified so callers can
//! `downcast_ref::<PipelineError>()` while the original cause stays in the
//! chain.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Request parameters that can never produce an image.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Pipeline settings that violate a slicing or planning precondition.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// Buffers whose shape does not match the layout they are combined with.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The external upscaler failed on one block; the request is aborted.
    #[error("block {index} (grid row {grid_row}, col {grid_col}) failed to upscale")]
    BlockFailed {
        index: usize,
        grid_row: usize,
        grid_col: usize,
    },

    /// A blocking task panicked or was cancelled before returning.
    #[error("{stage} task did not complete")]
    TaskJoin { stage: &'static str },
}
