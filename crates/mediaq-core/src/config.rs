use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::events::DEFAULT_CAPACITY;

/// External program used by the command backend (optional `[backend]` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Program name or path of a yt-dlp compatible downloader.
    pub program: String,
    /// Arguments passed before the generated ones (e.g. cookies, proxy).
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Global configuration loaded from `~/.config/mediaq/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of jobs executing at once. Read once when the scheduler is built.
    pub max_concurrent_jobs: usize,
    /// Default destination directory (None = current directory).
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Broadcast buffer size for UI subscribers (None = built-in default).
    #[serde(default)]
    pub event_capacity: Option<usize>,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            output_dir: None,
            event_capacity: None,
            backend: BackendConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn event_capacity(&self) -> usize {
        self.event_capacity.unwrap_or(DEFAULT_CAPACITY).max(1)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("mediaq")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<QueueConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = QueueConfig::default();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, default_cfg.to_toml()?)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }
    load_from_path(&path)
}

pub fn load_from_path(path: &Path) -> Result<QueueConfig> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: QueueConfig =
        toml::from_str(&data).with_context(|| format!("parse config: {}", path.display()))?;
    Ok(cfg)
}
