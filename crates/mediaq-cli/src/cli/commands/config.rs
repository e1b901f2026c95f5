//! `mediaq config` – show the config file path and effective values.

use anyhow::Result;
use mediaq_core::config::{self, QueueConfig};

pub fn run_config(cfg: &QueueConfig) -> Result<()> {
    println!("# {}", config::config_path()?.display());
    print!("{}", cfg.to_toml()?);
    Ok(())
}
