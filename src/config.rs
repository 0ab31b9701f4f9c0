use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::ModelSpec;
use crate::orchestration::{InvokerConfig, PipelineConfig, PoolConfig, VerifierConfig};
use crate::{flog_debug, Error, Result};

/// Fallback model when resolution finds nothing available.
pub const DEFAULT_MODEL: &str = "qwen2.5-coder:7b";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model used when no registry entry is available for a role.
    pub default_model: String,
    /// Reject plans whose tasks depend on ids that don't exist.
    pub strict_dependencies: bool,
    pub pipeline: PipelineConfig,
    pub pool: PoolConfig,
    pub invoker: InvokerConfig,
    pub verifier: VerifierConfig,
    /// Extra registry entries, appended to the built-in catalog.
    pub models: Vec<ModelSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            strict_dependencies: true,
            pipeline: PipelineConfig::default(),
            pool: PoolConfig::default(),
            invoker: InvokerConfig::default(),
            verifier: VerifierConfig::default(),
            models: Vec::new(),
        }
    }
}

impl Config {
    pub fn foundry_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foundry"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foundry_dir()?.join("foundry.toml"))
    }

    /// Load `~/.foundry/foundry.toml`, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        flog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        flog_debug!(
            "Config loaded: default_model={}, capacity={}, max_iterations={}, extra_models={}",
            config.default_model,
            config.pool.capacity,
            config.pipeline.max_iterations,
            config.models.len()
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                flog_debug!("Creating config directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity == 0 {
            return Err(Error::Validation("pool.capacity must be at least 1".into()));
        }
        if self.pool.min_limit == 0 || self.pool.min_limit > self.pool.capacity {
            return Err(Error::Validation(format!(
                "pool.min_limit must be within 1..={}",
                self.pool.capacity
            )));
        }
        if self.pool.low_watermark >= self.pool.high_watermark {
            return Err(Error::Validation(
                "pool.low_watermark must be below pool.high_watermark".into(),
            ));
        }
        if self.pipeline.max_iterations == 0 {
            return Err(Error::Validation(
                "pipeline.max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
