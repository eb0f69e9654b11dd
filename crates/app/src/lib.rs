use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use image::{imageops::FilterType, DynamicImage, GrayImage, RgbImage, RgbaImage};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use tileforge_core::collaborators::{
    BaseGenerator, BlockUpscaler, FaceDetector, FaceRestorer, FixedFaces, NoFaces,
};
use tileforge_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use tileforge_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use tileforge_core::models::{
    InferenceBackend, OnnxBlockUpscaler, OnnxFaceRestorer, ResampleUpscaler, SessionConfig,
};
use tileforge_core::planner::plan_dimensions;
use tileforge_core::types::{Canvas, FaceRegion};
use tileforge_core::{Collaborators, Orchestrator, RenderRequest, SharedResources};

#[derive(Parser)]
#[command(
    name = "tileforge",
    about = "Tiled upscale-and-reconstruct image pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline and write the final image.
    Render(RenderArgs),
    /// Print the generation and final dimensions for a requested size.
    Plan(PlanArgs),
}

#[derive(Args)]
struct RenderArgs {
    #[arg(long, help = "Image the base generator resamples to the generation size")]
    source: PathBuf,
    #[arg(long, default_value = "")]
    prompt: String,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long, default_value_t = 30)]
    steps: u32,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(
        long = "face",
        value_name = "X,Y,W,H",
        help = "Face box in generation coordinates (repeatable)"
    )]
    faces: Vec<FaceRegion>,
    #[arg(long, help = "Super-resolution ONNX model (overrides config)")]
    upscaler: Option<PathBuf>,
    #[arg(long, help = "Face restoration ONNX model (overrides config)")]
    restorer: Option<PathBuf>,
    #[arg(long, value_name = "cuda|tensorrt")]
    backend: Option<String>,
    #[arg(long, help = "Upscale factor of the block model (overrides config)")]
    scale: Option<usize>,
    #[arg(short = 'o', long)]
    output: PathBuf,
    #[arg(long, help = "Write the run report as JSON")]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir);
    match cli.command {
        Commands::Render(args) => run_render(args, config, resolved_data_dir).await,
        Commands::Plan(args) => run_plan(args, &config),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

fn run_plan(args: PlanArgs, config: &AppConfig) -> Result<()> {
    let limits = config.pipeline.limits();
    limits.validate()?;
    let plan = plan_dimensions(args.width, args.height, &limits);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn run_render(args: RenderArgs, mut config: AppConfig, data_dir: PathBuf) -> Result<()> {
    if let Some(backend) = args.backend.as_deref() {
        config.models.backend = InferenceBackend::from_str_lossy(backend);
    }
    if let Some(scale) = args.scale {
        config.models.upscale_factor = scale;
    }
    if config.models.upscale_factor == 0 {
        bail!("upscale factor must be positive");
    }

    let upscaler_path = args
        .upscaler
        .clone()
        .or_else(|| {
            config
                .models
                .upscaler
                .as_deref()
                .map(|model| config.resolve_model_path(&data_dir, model))
        });
    let restorer_path = args
        .restorer
        .clone()
        .or_else(|| {
            config
                .models
                .restorer
                .as_deref()
                .map(|model| config.resolve_model_path(&data_dir, model))
        });
    let trt_cache_dir = resolve_relative_to(&data_dir, &config.paths.trt_cache_dir);

    let generator: Arc<dyn BaseGenerator> = Arc::new(SourceImageGenerator::open(&args.source)?);
    let detector: Arc<dyn FaceDetector> = if args.faces.is_empty() {
        Arc::new(NoFaces)
    } else {
        Arc::new(FixedFaces::new(args.faces.clone()))
    };

    let upscaler: Arc<dyn BlockUpscaler> = match upscaler_path.as_deref() {
        Some(model_path) => Arc::new(OnnxBlockUpscaler::load(
            &SessionConfig {
                model_path,
                backend: config.models.backend,
                trt_cache_dir: Some(trt_cache_dir.as_path()),
            },
            config.models.upscale_factor,
        )?),
        None => {
            info!(
                scale = config.models.upscale_factor,
                algorithm = ?config.pipeline.resize_algorithm,
                "No upscaler model configured, resampling blocks"
            );
            Arc::new(ResampleUpscaler::new(
                config.models.upscale_factor,
                config.pipeline.resize_algorithm,
            ))
        }
    };

    let restorer: Option<Arc<dyn FaceRestorer>> = match restorer_path.as_deref() {
        Some(model_path) => Some(Arc::new(OnnxFaceRestorer::load(&SessionConfig {
            model_path,
            backend: config.models.backend,
            trt_cache_dir: Some(trt_cache_dir.as_path()),
        })?)),
        None => {
            if !args.faces.is_empty() {
                warn!("Face regions given without a restorer model; face pass will be skipped");
            }
            None
        }
    };

    let resources = SharedResources::new(config.pipeline.max_concurrent);
    let orchestrator = Orchestrator::new(
        config.pipeline.clone(),
        resources,
        Collaborators {
            generator,
            detector,
            upscaler,
            restorer,
        },
    )?;

    let request = RenderRequest {
        prompt: args.prompt,
        width: args.width,
        height: args.height,
        steps: args.steps,
        seed: args.seed,
    };

    let started = Instant::now();
    let result = orchestrator
        .run_pipeline(request)
        .await
        .context("Render failed")?;

    save_canvas(&result.canvas, &args.output)?;
    info!(
        output = %args.output.display(),
        width = result.canvas.width(),
        height = result.canvas.height(),
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Render completed successfully"
    );
    for timing in result.report.timings.iter() {
        info!(
            "  {:<16} {:>10.1} ms",
            timing.stage,
            timing.elapsed.as_secs_f64() * 1000.0
        );
    }

    if let Some(report_path) = args.report.as_deref() {
        let json = serde_json::to_string_pretty(&result.report)
            .context("failed to serialize run report")?;
        std::fs::write(report_path, json)
            .with_context(|| format!("failed to write report: {}", report_path.display()))?;
        info!(report = %report_path.display(), "Wrote run report");
    }

    Ok(())
}

/// Stands in for a diffusion model: resamples one source image to whatever
/// size the planner asks for. Prompt, steps and seed are only logged.
struct SourceImageGenerator {
    source: RgbImage,
}

impl SourceImageGenerator {
    fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Source image does not exist: {}", path.display());
        }
        let source = image::open(path)
            .with_context(|| format!("failed to decode source image: {}", path.display()))?
            .to_rgb8();
        info!(
            source = %path.display(),
            width = source.width(),
            height = source.height(),
            "Loaded source image"
        );
        Ok(Self { source })
    }
}

impl BaseGenerator for SourceImageGenerator {
    fn generate(
        &self,
        prompt: &str,
        width: usize,
        height: usize,
        steps: u32,
        seed: u64,
    ) -> Result<Canvas> {
        debug!(prompt, width, height, steps, seed, "Resampling source image");
        let resized = image::imageops::resize(
            &self.source,
            width as u32,
            height as u32,
            FilterType::Lanczos3,
        );
        Canvas::from_interleaved_u8(resized.as_raw(), width, height, 3)
    }
}

fn canvas_to_image(canvas: &Canvas) -> Result<DynamicImage> {
    let (width, height) = (canvas.width() as u32, canvas.height() as u32);
    let data = canvas.to_interleaved_u8();
    let image = match canvas.channels() {
        1 => GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
        other => bail!("cannot encode a canvas with {other} channels"),
    };
    image.context("canvas buffer does not match its dimensions")
}

fn save_canvas(canvas: &Canvas, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    canvas_to_image(canvas)?
        .save(path)
        .with_context(|| format!("failed to write image: {}", path.display()))
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}


#[cfg(test)]
mod image_io_tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn source_generator_resamples_to_requested_size() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("source.png");
        RgbImage::from_pixel(40, 30, image::Rgb([10, 120, 250]))
            .save(&path)
            .expect("write source");

        let generator = SourceImageGenerator::open(&path).expect("open source");
        let canvas = generator
            .generate("a lighthouse", 64, 48, 20, 7)
            .expect("generate");
        assert_eq!((canvas.width(), canvas.height(), canvas.channels()), (64, 48, 3));

        let px = canvas.pixels();
        assert!((px[[20, 30, 0]] - 10.0).abs() <= 1.0);
        assert!((px[[20, 30, 1]] - 120.0).abs() <= 1.0);
        assert!((px[[20, 30, 2]] - 250.0).abs() <= 1.0);
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let err = SourceImageGenerator::open(&dir.path().join("nope.png"))
            .err()
            .expect("missing file");
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn saved_canvas_reads_back() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("out.png");
        let canvas = Canvas::filled(12, 8, 3, 200.4).expect("canvas");

        save_canvas(&canvas, &path).expect("save");
        let decoded = image::open(&path).expect("decode").to_rgb8();
        assert_eq!(decoded.dimensions(), (12, 8));
        assert_eq!(decoded.get_pixel(5, 5).0, [200, 200, 200]);
    }

    #[test]
    fn two_channel_canvas_cannot_be_encoded() {
        let canvas = Canvas::filled(4, 4, 2, 0.0).expect("canvas");
        assert!(canvas_to_image(&canvas).is_err());
    }
}
