use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::compositor::{FACE_FEATHER, FACE_PADDING};
use crate::error::PipelineError;
use crate::models::InferenceBackend;
use crate::planner::{DimensionLimits, MAX_FINAL, MAX_GEN, MIN_GEN};
use crate::resize::ResizeAlgorithm;
use crate::slicer::validate_block_geometry;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TILEFORGE_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub pipeline: PipelineSettings,
    pub models: ModelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

/// Tuning for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    /// Side of each square block handed to the upscaler.
    pub block_size: usize,
    /// Pixels shared by neighboring blocks; also the feather ramp width.
    pub overlap: usize,
    /// Upscaler calls in flight at once, across all requests.
    pub max_concurrent: usize,
    pub max_final: u32,
    pub min_gen: u32,
    pub max_gen: u32,
    pub face_padding: f32,
    pub face_feather: f32,
    pub resize_algorithm: ResizeAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelsConfig {
    /// Super-resolution model; without one blocks are resampled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upscaler: Option<PathBuf>,
    /// Face restoration model; without one the face pass is skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restorer: Option<PathBuf>,
    pub upscale_factor: usize,
    pub backend: InferenceBackend,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            block_size: 256,
            overlap: 32,
            max_concurrent: 2,
            max_final: MAX_FINAL,
            min_gen: MIN_GEN,
            max_gen: MAX_GEN,
            face_padding: FACE_PADDING,
            face_feather: FACE_FEATHER,
            resize_algorithm: ResizeAlgorithm::Bilinear,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            upscaler: None,
            restorer: None,
            upscale_factor: 4,
            backend: InferenceBackend::Cuda,
        }
    }
}

impl PipelineSettings {
    pub fn limits(&self) -> DimensionLimits {
        DimensionLimits {
            max_final: self.max_final,
            min_gen: self.min_gen,
            max_gen: self.max_gen,
        }
    }

    /// Reject settings the slicer, planner or compositor cannot work with.
    pub fn validate(&self) -> Result<()> {
        validate_block_geometry(self.block_size, self.overlap)?;
        if self.max_concurrent == 0 {
            return Err(
                PipelineError::InvalidConfig("max_concurrent must be at least 1".into()).into(),
            );
        }
        self.limits().validate()?;
        for (name, value) in [
            ("face_padding", self.face_padding),
            ("face_feather", self.face_feather),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{name} must be within [0, 1], got {value}"
                ))
                .into());
            }
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Model paths from the config are relative to `models_dir`, which is
    /// itself relative to the data directory.
    pub fn resolve_model_path(&self, data_dir: &Path, model: &Path) -> PathBuf {
        let models_dir = resolve_relative_to(data_dir, &self.paths.models_dir);
        resolve_relative_to(&models_dir, model)
    }
}

/// Resolve the data directory:
/// 1. CLI override if provided
/// 2. TILEFORGE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml unless one
/// already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` as-is if absolute, otherwise joined to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
