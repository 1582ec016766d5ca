//! Daemon configuration: `config.json` in the data directory, then
//! `NEUROCORE_*` environment overrides.

use std::path::PathBuf;

use neurocore::pipeline::PipelineConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::AppPaths;

pub const DEFAULT_ADDR: &str = "127.0.0.1:9876";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub addr: String,
    /// Reconstruction checkpoint; defaults to `crosscoder.ncx` in the data dir.
    pub model_path: Option<PathBuf>,
    /// Upper bound on simulations running at once.
    pub max_jobs: usize,
    pub pipeline: PipelineConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            model_path: None,
            max_jobs: 4,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load(paths: &AppPaths) -> Result<Self, ConfigError> {
        let path = paths.config_file();
        let base = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?
        } else {
            Self::default()
        };
        base.with_env(|var| std::env::var(var).ok())
    }

    /// Apply `NEUROCORE_ADDR`, `NEUROCORE_MODEL`, `NEUROCORE_SEED` and
    /// `NEUROCORE_MAX_JOBS` as returned by `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(addr) = lookup("NEUROCORE_ADDR") {
            self.addr = addr;
        }
        if let Some(model) = lookup("NEUROCORE_MODEL") {
            self.model_path = Some(PathBuf::from(model));
        }
        if let Some(seed) = lookup("NEUROCORE_SEED") {
            let parsed = seed.trim().parse::<u64>().map_err(|_| ConfigError::Env {
                var: "NEUROCORE_SEED",
                value: seed.clone(),
            })?;
            self.pipeline.seed = Some(parsed);
        }
        if let Some(jobs) = lookup("NEUROCORE_MAX_JOBS") {
            match jobs.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.max_jobs = n,
                _ => {
                    return Err(ConfigError::Env {
                        var: "NEUROCORE_MAX_JOBS",
                        value: jobs,
                    })
                }
            }
        }
        Ok(self)
    }

    pub fn model_path(&self, paths: &AppPaths) -> PathBuf {
        self.model_path
            .clone()
            .unwrap_or_else(|| paths.model_file())
    }
}
