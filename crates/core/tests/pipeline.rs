use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use ndarray::Array3;
use tileforge_core::collaborators::{
    BaseGenerator, BlockUpscaler, FaceDetector, FaceRestorer, FixedFaces, NoFaces,
};
use tileforge_core::config::PipelineSettings;
use tileforge_core::models::ResampleUpscaler;
use tileforge_core::orchestrator::{
    STAGE_DETECT_FACES, STAGE_GENERATE, STAGE_RESIZE, STAGE_RESTORE_FACES, STAGE_SLICE,
    STAGE_STITCH, STAGE_UPSCALE_BLOCKS,
};
use tileforge_core::resize::ResizeAlgorithm;
use tileforge_core::slicer::Block;
use tileforge_core::types::{FaceRegion, ModelOutput};
use tileforge_core::{
    Canvas, Collaborators, Orchestrator, PipelineError, RenderRequest, SharedResources,
};

fn pattern(width: usize, height: usize) -> Canvas {
    Canvas::new(Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
        ((x * 7 + y * 13 + c * 31) % 256) as f32
    }))
    .unwrap()
}

#[derive(Default)]
struct PatternGenerator {
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    seeds: Mutex<Vec<u64>>,
    fixed_size: Option<(usize, usize)>,
    delay: Duration,
}

impl BaseGenerator for PatternGenerator {
    fn generate(
        &self,
        _prompt: &str,
        width: usize,
        height: usize,
        _steps: u32,
        seed: u64,
    ) -> Result<Canvas> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.seeds.lock().unwrap().push(seed);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);

        let (width, height) = self.fixed_size.unwrap_or((width, height));
        Ok(pattern(width, height))
    }
}

/// Resamples blocks, counting calls and optionally failing one block.
struct CountingUpscaler {
    inner: ResampleUpscaler,
    calls: AtomicUsize,
    fail_on: Option<usize>,
}

impl CountingUpscaler {
    fn new(scale: usize) -> Self {
        Self {
            inner: ResampleUpscaler::new(scale, ResizeAlgorithm::Nearest),
            calls: AtomicUsize::new(0),
            fail_on: None,
        }
    }
}

impl BlockUpscaler for CountingUpscaler {
    fn upscale(&self, block: &Block) -> Result<ModelOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on == Some(block.index) {
            bail!("CUDA out of memory");
        }
        self.inner.upscale(block)
    }

    fn scale_factor(&self) -> usize {
        self.inner.scale_factor()
    }
}

/// Holds every block until the generator has run `generations` times.
struct GatedUpscaler {
    generator: Arc<PatternGenerator>,
    generations: usize,
}

impl BlockUpscaler for GatedUpscaler {
    fn upscale(&self, block: &Block) -> Result<ModelOutput> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.generator.calls.load(Ordering::SeqCst) < self.generations {
            if Instant::now() > deadline {
                bail!("generation lock was held while blocks were upscaling");
            }
            thread::sleep(Duration::from_millis(2));
        }
        Ok(ModelOutput::byte(block.pixels.clone()))
    }

    fn scale_factor(&self) -> usize {
        1
    }
}

struct WhiteRestorer {
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
}

impl WhiteRestorer {
    fn new(fail_on_call: Option<usize>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on_call,
        }
    }
}

impl FaceRestorer for WhiteRestorer {
    fn restore(&self, crop: &Canvas) -> Result<ModelOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_call == Some(call) {
            bail!("restorer failed on region");
        }
        Ok(ModelOutput::unit(Array3::from_elem(
            (crop.height(), crop.width(), crop.channels()),
            1.0,
        )))
    }
}

struct BrokenDetector;

impl FaceDetector for BrokenDetector {
    fn detect(&self, _canvas: &Canvas) -> Result<Vec<FaceRegion>> {
        bail!("detector model unavailable")
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        block_size: 128,
        overlap: 32,
        max_concurrent: 2,
        ..PipelineSettings::default()
    }
}

fn request(width: u32, height: u32) -> RenderRequest {
    RenderRequest {
        prompt: "a portrait in a garden".to_string(),
        width,
        height,
        steps: 20,
        seed: Some(42),
    }
}

fn orchestrator(
    resources: &SharedResources,
    generator: Arc<dyn BaseGenerator>,
    detector: Arc<dyn FaceDetector>,
    upscaler: Arc<dyn BlockUpscaler>,
    restorer: Option<Arc<dyn FaceRestorer>>,
) -> Orchestrator {
    Orchestrator::new(
        settings(),
        resources.clone(),
        Collaborators {
            generator,
            detector,
            upscaler,
            restorer,
        },
    )
    .expect("valid pipeline settings")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_run_delivers_requested_size_and_report() {
    let resources = SharedResources::new(2);
    let restorer = Arc::new(WhiteRestorer::new(None));
    let pipeline = orchestrator(
        &resources,
        Arc::new(PatternGenerator::default()),
        Arc::new(FixedFaces::new(vec![FaceRegion::new(100, 100, 60, 60)])),
        Arc::new(CountingUpscaler::new(2)),
        Some(restorer.clone()),
    );

    let result = pipeline.run_pipeline(request(600, 400)).await.unwrap();
    assert_eq!(
        (result.canvas.width(), result.canvas.height(), result.canvas.channels()),
        (600, 400, 3)
    );

    let report = &result.report;
    assert_eq!(report.seed, 42);
    assert_eq!(report.steps, 20);
    assert_eq!(
        (report.dimensions.gen_width, report.dimensions.gen_height),
        (592, 400)
    );
    assert_eq!(
        (report.dimensions.final_width, report.dimensions.final_height),
        (600, 400)
    );
    assert_eq!(report.upscale_factor, 2);
    assert_eq!((report.grid.rows, report.grid.cols), (4, 6));
    assert_eq!(report.faces_detected, 1);
    assert_eq!(report.faces_restored, 1);
    assert_eq!(restorer.calls.load(Ordering::SeqCst), 1);

    let stages: Vec<&str> = report.timings.iter().map(|t| t.stage.as_str()).collect();
    assert_eq!(
        stages,
        vec![
            STAGE_GENERATE,
            STAGE_DETECT_FACES,
            STAGE_SLICE,
            STAGE_UPSCALE_BLOCKS,
            STAGE_STITCH,
            STAGE_RESTORE_FACES,
            STAGE_RESIZE,
        ]
    );

    let json = serde_json::to_value(report).unwrap();
    assert_eq!(json["seed"], 42);
    assert_eq!(json["dimensions"]["final_width"], 600);
    assert_eq!(json["timings"].as_array().map(Vec::len), Some(7));
}

#[tokio::test]
async fn identity_pipeline_reproduces_base_image() {
    let resources = SharedResources::new(2);
    let pipeline = orchestrator(
        &resources,
        Arc::new(PatternGenerator::default()),
        Arc::new(NoFaces),
        Arc::new(CountingUpscaler::new(1)),
        None,
    );

    let result = pipeline.run_pipeline(request(512, 512)).await.unwrap();
    assert_eq!(
        result.canvas.to_interleaved_u8(),
        pattern(512, 512).to_interleaved_u8()
    );
}

#[tokio::test]
async fn missing_seed_is_derived_and_reported() {
    let resources = SharedResources::new(2);
    let generator = Arc::new(PatternGenerator::default());
    let pipeline = orchestrator(
        &resources,
        generator.clone(),
        Arc::new(NoFaces),
        Arc::new(CountingUpscaler::new(1)),
        None,
    );

    let result = pipeline
        .run_pipeline(RenderRequest {
            seed: None,
            ..request(512, 512)
        })
        .await
        .unwrap();
    assert_eq!(*generator.seeds.lock().unwrap(), vec![result.report.seed]);
}

#[tokio::test]
async fn sliced_scenario_matches_expected_geometry() {
    let resources = SharedResources::new(2);
    let generator = Arc::new(PatternGenerator {
        fixed_size: Some((300, 300)),
        ..PatternGenerator::default()
    });
    let upscaler = Arc::new(CountingUpscaler::new(4));
    let pipeline = orchestrator(
        &resources,
        generator,
        Arc::new(NoFaces),
        upscaler.clone(),
        None,
    );

    let result = pipeline.run_pipeline(request(300, 300)).await.unwrap();
    let grid = result.report.grid;
    assert_eq!(grid.stride, 96);
    assert_eq!((grid.rows, grid.cols), (3, 3));
    assert_eq!((grid.padded_width, grid.padded_height), (320, 320));
    assert_eq!(upscaler.calls.load(Ordering::SeqCst), 9);
    assert_eq!((result.canvas.width(), result.canvas.height()), (300, 300));
}

#[tokio::test]
async fn block_failure_fails_the_request() {
    let resources = SharedResources::new(2);
    let restorer = Arc::new(WhiteRestorer::new(None));
    let upscaler = Arc::new(CountingUpscaler {
        fail_on: Some(3),
        ..CountingUpscaler::new(2)
    });
    let pipeline = orchestrator(
        &resources,
        Arc::new(PatternGenerator::default()),
        Arc::new(FixedFaces::new(vec![FaceRegion::new(10, 10, 40, 40)])),
        upscaler,
        Some(restorer.clone()),
    );

    let error = pipeline
        .run_pipeline(request(512, 512))
        .await
        .expect_err("block 3 fails");
    assert!(matches!(
        error.downcast_ref::<PipelineError>(),
        Some(PipelineError::BlockFailed { index: 3, .. })
    ));
    assert_eq!(error.root_cause().to_string(), "CUDA out of memory");
    assert_eq!(restorer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_face_is_skipped_and_others_restored() {
    let resources = SharedResources::new(2);
    let pipeline = orchestrator(
        &resources,
        Arc::new(PatternGenerator::default()),
        Arc::new(FixedFaces::new(vec![
            FaceRegion::new(20, 20, 40, 40),
            FaceRegion::new(200, 200, 40, 40),
            FaceRegion::new(400, 40, 40, 40),
        ])),
        Arc::new(CountingUpscaler::new(1)),
        Some(Arc::new(WhiteRestorer::new(Some(1)))),
    );

    let result = pipeline.run_pipeline(request(512, 512)).await.unwrap();
    assert_eq!(result.report.faces_detected, 3);
    assert_eq!(result.report.faces_restored, 2);

    let base = pattern(512, 512);
    // the failed region keeps the base pixels, the restored ones turn white
    assert!((result.canvas.pixels()[[220, 220, 0]] - base.pixels()[[220, 220, 0]]).abs() < 1e-3);
    assert!(result.canvas.pixels()[[40, 40, 0]] > 240.0);
    assert!(result.canvas.pixels()[[60, 420, 1]] > 240.0);
}

#[tokio::test]
async fn detector_failure_skips_face_pass() {
    let resources = SharedResources::new(2);
    let restorer = Arc::new(WhiteRestorer::new(None));
    let pipeline = orchestrator(
        &resources,
        Arc::new(PatternGenerator::default()),
        Arc::new(BrokenDetector),
        Arc::new(CountingUpscaler::new(1)),
        Some(restorer.clone()),
    );

    let result = pipeline.run_pipeline(request(512, 512)).await.unwrap();
    assert_eq!(result.report.faces_detected, 0);
    assert_eq!(restorer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn zero_sized_request_is_rejected_before_generation() {
    let resources = SharedResources::new(2);
    let generator = Arc::new(PatternGenerator::default());
    let pipeline = orchestrator(
        &resources,
        generator.clone(),
        Arc::new(NoFaces),
        Arc::new(CountingUpscaler::new(1)),
        None,
    );

    let error = pipeline
        .run_pipeline(request(0, 512))
        .await
        .expect_err("zero width");
    assert!(matches!(
        error.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidRequest(_))
    ));
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn generation_is_serialized_across_orchestrators() {
    let resources = SharedResources::new(2);
    let generator = Arc::new(PatternGenerator {
        delay: Duration::from_millis(30),
        ..PatternGenerator::default()
    });
    let first = orchestrator(
        &resources,
        generator.clone(),
        Arc::new(NoFaces),
        Arc::new(CountingUpscaler::new(1)),
        None,
    );
    let second = orchestrator(
        &resources,
        generator.clone(),
        Arc::new(NoFaces),
        Arc::new(CountingUpscaler::new(1)),
        None,
    );

    let (a, b) = tokio::join!(
        first.run_pipeline(request(512, 512)),
        second.run_pipeline(request(512, 512)),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(generator.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_request_keeps_generation_serialized() {
    let resources = SharedResources::new(2);
    let generator = Arc::new(PatternGenerator {
        delay: Duration::from_millis(300),
        ..PatternGenerator::default()
    });
    let first = orchestrator(
        &resources,
        generator.clone(),
        Arc::new(NoFaces),
        Arc::new(CountingUpscaler::new(1)),
        None,
    );
    let second = orchestrator(
        &resources,
        generator.clone(),
        Arc::new(NoFaces),
        Arc::new(CountingUpscaler::new(1)),
        None,
    );

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        first.run_pipeline(request(512, 512)),
    )
    .await;
    assert!(abandoned.is_err(), "first request should still be generating");

    second.run_pipeline(request(512, 512)).await.unwrap();
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(generator.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn generation_lock_is_released_before_upscaling() {
    let resources = SharedResources::new(2);
    let generator = Arc::new(PatternGenerator::default());
    let upscaler = Arc::new(GatedUpscaler {
        generator: generator.clone(),
        generations: 2,
    });
    let first = orchestrator(
        &resources,
        generator.clone(),
        Arc::new(NoFaces),
        upscaler.clone(),
        None,
    );
    let second = orchestrator(&resources, generator, Arc::new(NoFaces), upscaler, None);

    let (a, b) = tokio::join!(
        first.run_pipeline(request(512, 512)),
        second.run_pipeline(request(512, 512)),
    );
    a.unwrap();
    b.unwrap();
}

#[test]
fn invalid_settings_are_rejected_at_construction() {
    let resources = SharedResources::new(2);
    let result = Orchestrator::new(
        PipelineSettings {
            block_size: 32,
            overlap: 32,
            ..PipelineSettings::default()
        },
        resources,
        Collaborators {
            generator: Arc::new(PatternGenerator::default()),
            detector: Arc::new(NoFaces),
            upscaler: Arc::new(CountingUpscaler::new(1)),
            restorer: None,
        },
    );
    let error = result.err().expect("overlap equal to block size");
    assert!(matches!(
        error.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidConfig(_))
    ));
}
