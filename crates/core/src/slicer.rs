//! Splits a canvas into overlapping square blocks on a zero-padded grid.

use anyhow::Result;
use ndarray::{s, Array3};
use serde::Serialize;
use tracing::debug;

use crate::error::PipelineError;
use crate::types::Canvas;

/// Geometry shared by the slicer and the stitcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GridLayout {
    pub block_size: usize,
    pub overlap: usize,
    pub stride: usize,
    pub rows: usize,
    pub cols: usize,
    pub padded_width: usize,
    pub padded_height: usize,
    pub original_width: usize,
    pub original_height: usize,
    pub channels: usize,
}

impl GridLayout {
    /// Compute the grid for a `width x height` canvas.
    ///
    /// Requires `0 < block_size` and `overlap < block_size`.
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        block_size: usize,
        overlap: usize,
    ) -> Result<Self> {
        validate_block_geometry(block_size, overlap)?;

        let stride = block_size - overlap;
        let cols = blocks_along(width, overlap, stride);
        let rows = blocks_along(height, overlap, stride);

        Ok(Self {
            block_size,
            overlap,
            stride,
            rows,
            cols,
            padded_width: (cols - 1) * stride + block_size,
            padded_height: (rows - 1) * stride + block_size,
            original_width: width,
            original_height: height,
            channels,
        })
    }

    pub fn block_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Pixel origin `(row, col)` of a block in the padded canvas.
    pub fn origin(&self, grid_row: usize, grid_col: usize) -> (usize, usize) {
        (grid_row * self.stride, grid_col * self.stride)
    }
}

pub fn validate_block_geometry(block_size: usize, overlap: usize) -> Result<()> {
    if block_size == 0 {
        return Err(PipelineError::InvalidConfig("block_size must be positive".into()).into());
    }
    if overlap >= block_size {
        return Err(PipelineError::InvalidConfig(format!(
            "overlap ({overlap}) must be smaller than block_size ({block_size})"
        ))
        .into());
    }
    Ok(())
}

/// `ceil((dim - overlap) / stride)`, at least one block.
fn blocks_along(dim: usize, overlap: usize, stride: usize) -> usize {
    dim.saturating_sub(overlap).div_ceil(stride).max(1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Submission order; row-major over the grid.
    pub index: usize,
    pub grid_row: usize,
    pub grid_col: usize,
    /// Pixel origin in the padded canvas.
    pub row: usize,
    pub col: usize,
    pub pixels: Array3<f32>,
}

impl Block {
    pub fn size(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn channels(&self) -> usize {
        self.pixels.dim().2
    }
}

#[derive(Debug, Clone)]
pub struct BlockGrid {
    pub layout: GridLayout,
    pub blocks: Vec<Block>,
}

impl BlockGrid {
    pub fn into_parts(self) -> (GridLayout, Vec<Block>) {
        (self.layout, self.blocks)
    }
}

/// Slice `canvas` into `block_size` squares advancing by
/// `block_size - overlap`, padding the right and bottom with zeros so the
/// last row and column of blocks fit.
pub fn slice_canvas(canvas: &Canvas, block_size: usize, overlap: usize) -> Result<BlockGrid> {
    let layout = GridLayout::new(
        canvas.width(),
        canvas.height(),
        canvas.channels(),
        block_size,
        overlap,
    )?;

    let mut padded =
        Array3::<f32>::zeros((layout.padded_height, layout.padded_width, layout.channels));
    padded
        .slice_mut(s![..canvas.height(), ..canvas.width(), ..])
        .assign(canvas.pixels());

    let mut blocks = Vec::with_capacity(layout.block_count());
    for grid_row in 0..layout.rows {
        for grid_col in 0..layout.cols {
            let (row, col) = layout.origin(grid_row, grid_col);
            blocks.push(Block {
                index: blocks.len(),
                grid_row,
                grid_col,
                row,
                col,
                pixels: padded
                    .slice(s![row..row + block_size, col..col + block_size, ..])
                    .to_owned(),
            });
        }
    }

    debug!(
        width = layout.original_width,
        height = layout.original_height,
        block_size,
        overlap,
        stride = layout.stride,
        rows = layout.rows,
        cols = layout.cols,
        padded_width = layout.padded_width,
        padded_height = layout.padded_height,
        "Sliced canvas into blocks"
    );

    Ok(BlockGrid { layout, blocks })
}
