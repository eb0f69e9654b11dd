use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ndarray::{s, Array3};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::planner::DimensionPlan;
use crate::slicer::GridLayout;

/// Pixel buffer shared by every pipeline stage.
///
/// Samples are `f32` in the byte range `[0, 255]`, laid out HWC
/// (`[height, width, channels]`).
#[derive(Debug, Clone, PartialEq)]
pub struct Canvas {
    pixels: Array3<f32>,
}

impl Canvas {
    pub fn new(pixels: Array3<f32>) -> Result<Self> {
        let (h, w, c) = pixels.dim();
        if h == 0 || w == 0 || c == 0 {
            return Err(PipelineError::InvalidGeometry(format!(
                "canvas must be non-empty, got {w}x{h}x{c}"
            ))
            .into());
        }
        Ok(Self { pixels })
    }

    pub fn filled(width: usize, height: usize, channels: usize, value: f32) -> Result<Self> {
        Self::new(Array3::from_elem((height, width, channels), value))
    }

    /// Build a canvas from interleaved 8-bit samples (`RGB24` when `channels == 3`).
    pub fn from_interleaved_u8(
        data: &[u8],
        width: usize,
        height: usize,
        channels: usize,
    ) -> Result<Self> {
        let expected_len = width * height * channels;
        if data.len() != expected_len {
            bail!(
                "Data length mismatch: expected {} ({}x{}x{}), got {}",
                expected_len,
                width,
                height,
                channels,
                data.len()
            );
        }

        let samples: Vec<f32> = data.iter().map(|&v| v as f32).collect();
        let pixels = Array3::from_shape_vec((height, width, channels), samples)
            .context("failed to reshape interleaved samples")?;
        Self::new(pixels)
    }

    /// Interleaved 8-bit samples, rounded and clamped to `0..=255`.
    pub fn to_interleaved_u8(&self) -> Vec<u8> {
        self.pixels
            .iter()
            .map(|v| v.round().clamp(0.0, 255.0) as u8)
            .collect()
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn channels(&self) -> usize {
        self.pixels.dim().2
    }

    pub fn pixels(&self) -> &Array3<f32> {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut Array3<f32> {
        &mut self.pixels
    }

    /// Copy out the `width x height` window whose top-left corner is `(x, y)`.
    pub fn crop(&self, x: usize, y: usize, width: usize, height: usize) -> Result<Canvas> {
        if x + width > self.width() || y + height > self.height() {
            return Err(PipelineError::InvalidGeometry(format!(
                "crop {width}x{height}+{x}+{y} exceeds canvas {}x{}",
                self.width(),
                self.height()
            ))
            .into());
        }
        Canvas::new(
            self.pixels
                .slice(s![y..y + height, x..x + width, ..])
                .to_owned(),
        )
    }
}

/// Value range a model boundary declares for its output samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueRange {
    /// `[0, 1]`
    Unit,
    /// `[0, 255]`
    Byte,
}

impl ValueRange {
    /// Multiplier that maps samples in this range onto `[0, 255]`.
    pub fn to_byte_factor(self) -> f32 {
        match self {
            Self::Unit => 255.0,
            Self::Byte => 1.0,
        }
    }
}

/// Output of an external model, tagged with the range its samples use.
///
/// Shape is whatever the model produced (HWC); each boundary adapter in
/// [`crate::adapt`] conforms it to what the consumer expects.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub pixels: Array3<f32>,
    pub range: ValueRange,
}

impl ModelOutput {
    pub fn unit(pixels: Array3<f32>) -> Self {
        Self {
            pixels,
            range: ValueRange::Unit,
        }
    }

    pub fn byte(pixels: Array3<f32>) -> Self {
        Self {
            pixels,
            range: ValueRange::Byte,
        }
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn channels(&self) -> usize {
        self.pixels.dim().2
    }
}

/// Face bounding box in base-canvas pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl fmt::Display for FaceRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

/// Parses `x,y,w,h`.
impl FromStr for FaceRegion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [x, y, w, h] = parts.as_slice() else {
            bail!("face region must be x,y,w,h, got '{s}'");
        };
        let parse = |name: &str, value: &&str| -> Result<u32> {
            value.parse::<u32>().with_context(|| {
                format!("face region {name} is not a non-negative integer: '{value}'")
            })
        };
        let region = Self::new(
            parse("x", x)?,
            parse("y", y)?,
            parse("w", w)?,
            parse("h", h)?,
        );
        if region.width == 0 || region.height == 0 {
            bail!("face region must have a non-zero size, got '{s}'");
        }
        Ok(region)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: String,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

/// Wall-clock time per pipeline stage, in the order stages ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StageTimings {
    stages: Vec<StageTiming>,
}

impl StageTimings {
    pub fn record(&mut self, stage: &str, elapsed: Duration) {
        self.stages.push(StageTiming {
            stage: stage.to_string(),
            elapsed,
        });
    }

    pub fn get(&self, stage: &str) -> Option<Duration> {
        self.stages
            .iter()
            .find(|timing| timing.stage == stage)
            .map(|timing| timing.elapsed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageTiming> {
        self.stages.iter()
    }

    pub fn total(&self) -> Duration {
        self.stages.iter().map(|timing| timing.elapsed).sum()
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Everything a finished request produced. Immutable once built.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub canvas: Canvas,
    pub report: PipelineReport,
}

/// Serializable part of a [`PipelineResult`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub request_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub seed: u64,
    pub steps: u32,
    pub dimensions: DimensionPlan,
    pub grid: GridLayout,
    pub upscale_factor: u32,
    pub faces_detected: usize,
    pub faces_restored: usize,
    pub timings: StageTimings,
}
