//! Feather-blend reconstruction of an upscaled canvas from its blocks.

use std::sync::Arc;

use anyhow::{Context, Result};
use ndarray::{s, Array2, Array3, Axis, Zip};
use tracing::debug;

use crate::adapt::conform_block;
use crate::error::PipelineError;
use crate::mask::MaskCache;
use crate::slicer::GridLayout;
use crate::types::{Canvas, ModelOutput};

/// Floor applied to the weight map before normalizing.
pub const WEIGHT_FLOOR: f32 = 1e-8;

pub struct Stitcher {
    masks: Arc<MaskCache>,
}

impl Stitcher {
    pub fn new(masks: Arc<MaskCache>) -> Self {
        Self { masks }
    }

    /// Blend upscaled blocks (in submission order) into one canvas of
    /// `original_dims * upscale_factor`.
    ///
    /// Every block is weighted by a feather mask whose ramp spans the scaled
    /// overlap, accumulated at its scaled grid origin, and the sum is divided
    /// by the accumulated weights.
    pub fn stitch(
        &self,
        layout: &GridLayout,
        outputs: Vec<ModelOutput>,
        upscale_factor: usize,
    ) -> Result<Canvas> {
        if outputs.len() != layout.block_count() {
            return Err(PipelineError::InvalidGeometry(format!(
                "expected {} upscaled blocks, got {}",
                layout.block_count(),
                outputs.len()
            ))
            .into());
        }
        if upscale_factor == 0 {
            return Err(
                PipelineError::InvalidConfig("upscale factor must be positive".into()).into(),
            );
        }

        let scaled_block = layout.block_size * upscale_factor;
        let scaled_stride = layout.stride * upscale_factor;
        let out_h = layout.padded_height * upscale_factor;
        let out_w = layout.padded_width * upscale_factor;
        let channels = layout.channels;

        let mask = self
            .masks
            .block(scaled_block, layout.overlap * upscale_factor);

        let mut accumulation = Array3::<f32>::zeros((out_h, out_w, channels));
        let mut weights = Array2::<f32>::zeros((out_h, out_w));

        for (index, output) in outputs.into_iter().enumerate() {
            let grid_row = index / layout.cols;
            let grid_col = index % layout.cols;
            let block = conform_block(output, scaled_block, channels)
                .with_context(|| format!("block {index} output could not be conformed"))?;

            let y0 = grid_row * scaled_stride;
            let x0 = grid_col * scaled_stride;
            let y1 = y0 + scaled_block;
            let x1 = x0 + scaled_block;

            let mut target = accumulation.slice_mut(s![y0..y1, x0..x1, ..]);
            Zip::from(target.lanes_mut(Axis(2)))
                .and(block.lanes(Axis(2)))
                .and(mask.view())
                .for_each(|mut acc, px, &m| {
                    acc.zip_mut_with(&px, |a, &p| *a += p * m);
                });
            weights
                .slice_mut(s![y0..y1, x0..x1])
                .zip_mut_with(&*mask, |w, &m| *w += m);
        }

        Zip::from(accumulation.lanes_mut(Axis(2)))
            .and(&weights)
            .for_each(|mut px, &w| {
                let w = w.max(WEIGHT_FLOOR);
                px.mapv_inplace(|v| v / w);
            });

        let crop_h = layout.original_height * upscale_factor;
        let crop_w = layout.original_width * upscale_factor;
        let cropped = accumulation.slice(s![..crop_h, ..crop_w, ..]).to_owned();

        debug!(
            blocks = layout.block_count(),
            upscale_factor,
            stitched_width = out_w,
            stitched_height = out_h,
            cropped_width = crop_w,
            cropped_height = crop_h,
            "Stitched upscaled blocks"
        );

        Canvas::new(cropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resize::{resize, ResizeAlgorithm};
    use crate::slicer::slice_canvas;

    fn stitcher() -> Stitcher {
        Stitcher::new(Arc::new(MaskCache::new()))
    }

    fn patterned_canvas(width: usize, height: usize, channels: usize) -> Canvas {
        let pixels = Array3::from_shape_fn((height, width, channels), |(y, x, c)| {
            ((x * 7 + y * 13 + c * 31) % 256) as f32
        });
        Canvas::new(pixels).unwrap()
    }

    #[test]
    fn identity_roundtrip_reproduces_canvas() {
        let canvas = patterned_canvas(300, 211, 3);
        let grid = slice_canvas(&canvas, 64, 16).unwrap();
        let (layout, blocks) = grid.into_parts();
        let outputs = blocks
            .into_iter()
            .map(|b| ModelOutput::byte(b.pixels))
            .collect();

        let stitched = stitcher().stitch(&layout, outputs, 1).unwrap();
        assert_eq!(stitched.width(), 300);
        assert_eq!(stitched.height(), 211);
        assert_eq!(stitched.to_interleaved_u8(), canvas.to_interleaved_u8());
    }

    #[test]
    fn identity_roundtrip_without_overlap() {
        let canvas = patterned_canvas(50, 70, 1);
        let (layout, blocks) = slice_canvas(&canvas, 16, 0).unwrap().into_parts();
        let outputs = blocks
            .into_iter()
            .map(|b| ModelOutput::byte(b.pixels))
            .collect();
        let stitched = stitcher().stitch(&layout, outputs, 1).unwrap();
        assert_eq!(stitched.to_interleaved_u8(), canvas.to_interleaved_u8());
    }

    #[test]
    fn blend_midpoint_is_even_average_of_two_constant_blocks() {
        // Two blocks side by side: 16 wide with a 5 pixel overlap.
        let layout = GridLayout::new(27, 16, 1, 16, 5).unwrap();
        assert_eq!((layout.rows, layout.cols), (1, 2));
        let outputs = vec![
            ModelOutput::byte(Array3::from_elem((16, 16, 1), 200.0)),
            ModelOutput::byte(Array3::from_elem((16, 16, 1), 100.0)),
        ];

        let stitched = stitcher().stitch(&layout, outputs, 1).unwrap();
        let px = stitched.pixels();
        // band covers columns 11..16, midpoint column 13
        assert!((px[[8, 13, 0]] - 150.0).abs() < 1e-3);
        assert!((px[[8, 5, 0]] - 200.0).abs() < 1e-3);
        assert!((px[[8, 20, 0]] - 100.0).abs() < 1e-3);
        // blend is monotone across the band
        for x in 11..16 {
            assert!(px[[8, x, 0]] <= px[[8, x - 1, 0]] + 1e-3);
        }
    }

    #[test]
    fn scaled_stitch_matches_expected_geometry() {
        let canvas = patterned_canvas(300, 300, 3);
        let (layout, blocks) = slice_canvas(&canvas, 128, 32).unwrap().into_parts();
        assert_eq!(layout.block_count(), 9);
        assert_eq!((layout.padded_width, layout.padded_height), (320, 320));

        let outputs = blocks
            .into_iter()
            .map(|b| {
                ModelOutput::byte(resize(b.pixels.view(), 512, 512, ResizeAlgorithm::Nearest))
            })
            .collect();
        let stitched = stitcher().stitch(&layout, outputs, 4).unwrap();
        assert_eq!((stitched.width(), stitched.height()), (1200, 1200));

        // nearest 4x upscale followed by a blend of agreeing blocks keeps each source pixel
        let src = canvas.pixels();
        for (y, x) in [(0, 0), (150, 37), (299, 299), (95, 96)] {
            for c in 0..3 {
                assert!(
                    (stitched.pixels()[[y * 4 + 1, x * 4 + 2, c]] - src[[y, x, c]]).abs() < 1e-2,
                    "pixel ({y}, {x}, {c})"
                );
            }
        }
    }

    #[test]
    fn undersized_block_outputs_are_resampled() {
        let canvas = Canvas::filled(40, 40, 3, 90.0).unwrap();
        let (layout, blocks) = slice_canvas(&canvas, 32, 8).unwrap().into_parts();
        let outputs = blocks
            .into_iter()
            .map(|_| ModelOutput::unit(Array3::from_elem((60, 60, 3), 90.0 / 255.0)))
            .collect();
        let stitched = stitcher().stitch(&layout, outputs, 2).unwrap();
        assert_eq!((stitched.width(), stitched.height()), (80, 80));
        assert!(stitched.pixels().iter().all(|&v| (v - 90.0).abs() < 1e-2));
    }

    #[test]
    fn rejects_wrong_block_count() {
        let layout = GridLayout::new(100, 100, 3, 64, 16).unwrap();
        let err = stitcher()
            .stitch(&layout, vec![ModelOutput::byte(Array3::zeros((64, 64, 3)))], 1)
            .expect_err("should fail");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidGeometry(_))
        ));
    }
}
