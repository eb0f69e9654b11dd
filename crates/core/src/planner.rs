//! Dimension planning: which size the base generator renders at, and which
//! size the finished image is delivered at.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Hard ceiling on either side of the delivered image.
pub const MAX_FINAL: u32 = 8192;
/// Lower bound for the larger side of the generation canvas.
pub const MIN_GEN: u32 = 512;
/// Upper bound for the larger side of the generation canvas.
pub const MAX_GEN: u32 = 1024;
/// Generator input sides must be multiples of this.
pub const GEN_ALIGN: u32 = 16;
/// Smallest side the generator accepts.
pub const GEN_FLOOR: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionLimits {
    pub max_final: u32,
    pub min_gen: u32,
    pub max_gen: u32,
}

impl Default for DimensionLimits {
    fn default() -> Self {
        Self {
            max_final: MAX_FINAL,
            min_gen: MIN_GEN,
            max_gen: MAX_GEN,
        }
    }
}

impl DimensionLimits {
    /// Requires `GEN_FLOOR <= min_gen <= max_gen <= max_final` with both
    /// generation limits aligned to [`GEN_ALIGN`].
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(PipelineError::InvalidConfig(msg).into())
        }
        if self.min_gen < GEN_FLOOR {
            return invalid(format!("min_gen ({}) must be at least {GEN_FLOOR}", self.min_gen));
        }
        if self.min_gen > self.max_gen {
            return invalid(format!(
                "min_gen ({}) must not exceed max_gen ({})",
                self.min_gen, self.max_gen
            ));
        }
        if self.max_gen > self.max_final {
            return invalid(format!(
                "max_gen ({}) must not exceed max_final ({})",
                self.max_gen, self.max_final
            ));
        }
        if self.min_gen % GEN_ALIGN != 0 || self.max_gen % GEN_ALIGN != 0 {
            return invalid(format!(
                "min_gen ({}) and max_gen ({}) must be multiples of {GEN_ALIGN}",
                self.min_gen, self.max_gen
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionPlan {
    pub gen_width: u32,
    pub gen_height: u32,
    pub final_width: u32,
    pub final_height: u32,
}

/// Plan generation and final sizes for a requested `width x height`.
///
/// Total: zero sides are treated as 1, and the result is always a valid
/// generator input (multiples of [`GEN_ALIGN`], at least [`GEN_FLOOR`]).
pub fn plan_dimensions(width: u32, height: u32, limits: &DimensionLimits) -> DimensionPlan {
    let (final_width, final_height) = clamp_to_max(width.max(1), height.max(1), limits.max_final);

    let largest = final_width.max(final_height) as f64;
    let scale = if largest > limits.max_gen as f64 {
        limits.max_gen as f64 / largest
    } else if largest < limits.min_gen as f64 {
        limits.min_gen as f64 / largest
    } else {
        1.0
    };

    DimensionPlan {
        gen_width: align_generation_side(final_width as f64 * scale),
        gen_height: align_generation_side(final_height as f64 * scale),
        final_width,
        final_height,
    }
}

fn clamp_to_max(width: u32, height: u32, max_final: u32) -> (u32, u32) {
    let largest = width.max(height);
    if largest <= max_final {
        return (width, height);
    }

    let scale = max_final as f64 / largest as f64;
    let scaled = |side: u32| ((side as f64 * scale).round() as u32).clamp(1, max_final);
    (scaled(width), scaled(height))
}

fn align_generation_side(side: f64) -> u32 {
    let side = side.round() as u32;
    (side / GEN_ALIGN * GEN_ALIGN).max(GEN_FLOOR)
}
