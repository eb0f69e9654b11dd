//! Request-level sequencing of the upscale pipeline.
//!
//! generate -> detect_faces -> slice -> upscale_blocks -> stitch ->
//! restore_faces -> resize. Only the generator call holds the generation
//! lock; block upscaling is bounded by the shared permit pool; every other
//! stage runs on one blocking task at a time.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::{BaseGenerator, BlockUpscaler, FaceDetector, FaceRestorer};
use crate::compositor::{CompositeReport, FaceCompositor};
use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::mask::MaskCache;
use crate::planner::plan_dimensions;
use crate::processor::BlockProcessor;
use crate::resize::resize_canvas;
use crate::slicer::slice_canvas;
use crate::stitcher::Stitcher;
use crate::types::{PipelineReport, PipelineResult, StageTimings};

pub const STAGE_GENERATE: &str = "generate";
pub const STAGE_DETECT_FACES: &str = "detect_faces";
pub const STAGE_SLICE: &str = "slice";
pub const STAGE_UPSCALE_BLOCKS: &str = "upscale_blocks";
pub const STAGE_STITCH: &str = "stitch";
pub const STAGE_RESTORE_FACES: &str = "restore_faces";
pub const STAGE_RESIZE: &str = "resize";

/// Process-wide handles shared by every orchestrator that renders on the
/// same accelerator. Clones share the same underlying lock, permits and
/// mask cache.
#[derive(Clone)]
pub struct SharedResources {
    generation_lock: Arc<Mutex<()>>,
    block_permits: Arc<Semaphore>,
    masks: Arc<MaskCache>,
}

impl SharedResources {
    pub fn new(max_concurrent_blocks: usize) -> Self {
        Self {
            generation_lock: Arc::new(Mutex::new(())),
            block_permits: Arc::new(Semaphore::new(max_concurrent_blocks.max(1))),
            masks: Arc::new(MaskCache::new()),
        }
    }

    pub fn generation_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.generation_lock)
    }

    pub fn block_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.block_permits)
    }

    pub fn masks(&self) -> Arc<MaskCache> {
        Arc::clone(&self.masks)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    /// Derived from the request id when absent.
    pub seed: Option<u64>,
}

impl RenderRequest {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::InvalidRequest(format!(
                "width and height must be positive, got {}x{}",
                self.width, self.height
            ))
            .into());
        }
        Ok(())
    }
}

/// The external models one orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn BaseGenerator>,
    pub detector: Arc<dyn FaceDetector>,
    pub upscaler: Arc<dyn BlockUpscaler>,
    /// Without a restorer the face pass is skipped.
    pub restorer: Option<Arc<dyn FaceRestorer>>,
}

pub struct Orchestrator {
    settings: PipelineSettings,
    resources: SharedResources,
    collaborators: Collaborators,
    processor: BlockProcessor,
    stitcher: Arc<Stitcher>,
    compositor: Arc<FaceCompositor>,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        resources: SharedResources,
        collaborators: Collaborators,
    ) -> Result<Self> {
        settings.validate()?;
        if collaborators.upscaler.scale_factor() == 0 {
            return Err(PipelineError::InvalidConfig(
                "upscaler reports a scale factor of 0".into(),
            )
            .into());
        }

        let processor = BlockProcessor::new(settings.max_concurrent, resources.block_permits());
        let stitcher = Arc::new(Stitcher::new(resources.masks()));
        let compositor = Arc::new(FaceCompositor::with_settings(
            settings.face_padding,
            settings.face_feather,
            resources.masks(),
        ));

        Ok(Self {
            settings,
            resources,
            collaborators,
            processor,
            stitcher,
            compositor,
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn run_pipeline(&self, request: RenderRequest) -> Result<PipelineResult> {
        request.validate()?;

        let request_id = Uuid::new_v4();
        let started_at = Utc::now();
        let seed = request.seed.unwrap_or_else(|| request_id.as_u64_pair().0);
        let plan = plan_dimensions(request.width, request.height, &self.settings.limits());
        let factor = self.collaborators.upscaler.scale_factor();
        let mut timings = StageTimings::default();

        info!(
            %request_id,
            width = request.width,
            height = request.height,
            gen_width = plan.gen_width,
            gen_height = plan.gen_height,
            final_width = plan.final_width,
            final_height = plan.final_height,
            steps = request.steps,
            seed,
            upscale_factor = factor,
            "Starting render"
        );

        let base = timed(&mut timings, request_id, STAGE_GENERATE, async {
            // Owned so an abandoned request keeps the lock until generate returns.
            let generation = Arc::clone(&self.resources.generation_lock)
                .lock_owned()
                .await;
            let generator = Arc::clone(&self.collaborators.generator);
            let prompt = request.prompt.clone();
            let steps = request.steps;
            let (gen_w, gen_h) = (plan.gen_width as usize, plan.gen_height as usize);
            run_blocking(STAGE_GENERATE, move || {
                let _generation = generation;
                generator
                    .generate(&prompt, gen_w, gen_h, steps, seed)
                    .context("base image generation failed")
            })
            .await
        })
        .await?;
        if (base.width(), base.height()) != (plan.gen_width as usize, plan.gen_height as usize) {
            warn!(
                %request_id,
                width = base.width(),
                height = base.height(),
                gen_width = plan.gen_width,
                gen_height = plan.gen_height,
                "Generator returned a canvas of unexpected size"
            );
        }
        let base = Arc::new(base);

        let faces = timed(&mut timings, request_id, STAGE_DETECT_FACES, async {
            let detector = Arc::clone(&self.collaborators.detector);
            let canvas = Arc::clone(&base);
            let detected =
                run_blocking(STAGE_DETECT_FACES, move || detector.detect(&canvas)).await;
            Ok(detected.unwrap_or_else(|error| {
                warn!(
                    %request_id,
                    error = %format!("{error:#}"),
                    "Face detection failed, skipping face restoration"
                );
                Vec::new()
            }))
        })
        .await?;

        let grid = timed(&mut timings, request_id, STAGE_SLICE, async {
            let canvas = Arc::clone(&base);
            let (block_size, overlap) = (self.settings.block_size, self.settings.overlap);
            run_blocking(STAGE_SLICE, move || {
                slice_canvas(&canvas, block_size, overlap)
            })
            .await
        })
        .await?;
        drop(base);
        let (layout, blocks) = grid.into_parts();
        debug!(
            %request_id,
            blocks = layout.block_count(),
            rows = layout.rows,
            cols = layout.cols,
            "Sliced base canvas"
        );

        let outputs = timed(
            &mut timings,
            request_id,
            STAGE_UPSCALE_BLOCKS,
            self.processor
                .process(blocks, Arc::clone(&self.collaborators.upscaler)),
        )
        .await?;

        let stitched = timed(&mut timings, request_id, STAGE_STITCH, async {
            let stitcher = Arc::clone(&self.stitcher);
            run_blocking(STAGE_STITCH, move || stitcher.stitch(&layout, outputs, factor)).await
        })
        .await?;

        let (restored, face_report) = timed(&mut timings, request_id, STAGE_RESTORE_FACES, async {
            let restorer = match (&self.collaborators.restorer, faces.is_empty()) {
                (Some(restorer), false) => Arc::clone(restorer),
                _ => return Ok((stitched, CompositeReport::default())),
            };
            let compositor = Arc::clone(&self.compositor);
            let faces = faces.clone();
            run_blocking(STAGE_RESTORE_FACES, move || {
                let mut canvas = stitched;
                let report = compositor.composite(&mut canvas, &faces, factor, restorer.as_ref());
                Ok((canvas, report))
            })
            .await
        })
        .await?;

        let canvas = timed(&mut timings, request_id, STAGE_RESIZE, async {
            let (width, height) = (plan.final_width as usize, plan.final_height as usize);
            let algorithm = self.settings.resize_algorithm;
            run_blocking(STAGE_RESIZE, move || {
                resize_canvas(&restored, width, height, algorithm)
            })
            .await
        })
        .await?;

        info!(
            %request_id,
            width = canvas.width(),
            height = canvas.height(),
            faces_detected = faces.len(),
            faces_restored = face_report.restored.len(),
            faces_skipped = face_report.skipped.len(),
            elapsed_ms = timings.total().as_millis() as u64,
            "Render finished"
        );

        Ok(PipelineResult {
            canvas,
            report: PipelineReport {
                request_id,
                started_at,
                seed,
                steps: request.steps,
                dimensions: plan,
                grid: layout,
                upscale_factor: factor as u32,
                faces_detected: faces.len(),
                faces_restored: face_report.restored.len(),
                timings,
            },
        })
    }
}

async fn timed<T, F>(
    timings: &mut StageTimings,
    request_id: Uuid,
    stage: &'static str,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let result = work.await;
    let elapsed = started.elapsed();
    timings.record(stage, elapsed);
    match &result {
        Ok(_) => debug!(
            %request_id,
            stage,
            elapsed_ms = elapsed.as_millis() as u64,
            "Stage finished"
        ),
        Err(error) => warn!(
            %request_id,
            stage,
            elapsed_ms = elapsed.as_millis() as u64,
            error = %format!("{error:#}"),
            "Stage failed"
        ),
    }
    result
}

async fn run_blocking<T, F>(stage: &'static str, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| anyhow::Error::new(error).context(PipelineError::TaskJoin { stage }))?
}
