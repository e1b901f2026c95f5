//! CLI for the mediaq fetch queue.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mediaq_core::config;
use std::path::PathBuf;

use commands::{run_config, run_fetch, run_probe, FetchOptions};

/// Top-level CLI for the mediaq fetch queue.
#[derive(Debug, Parser)]
#[command(name = "mediaq")]
#[command(about = "mediaq: queue and fetch remote media as audio or video files", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Queue one or more URLs and fetch them, several at a time.
    Fetch {
        /// Page or media URLs (http/https).
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,

        /// Extract audio instead of keeping the video.
        #[arg(long)]
        audio: bool,

        /// Audio format (e.g. mp3, opus) or video format selector.
        #[arg(long, value_name = "Q")]
        quality: Option<String>,

        /// Destination directory (default: config `output_dir`, else the current directory).
        #[arg(long, short = 'o', value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Run up to N jobs at once (default: config `max_concurrent_jobs`).
        #[arg(long, short = 'j', value_name = "N")]
        jobs: Option<usize>,
    },

    /// Resolve metadata for a URL without downloading.
    Probe {
        /// Page or media URL (http/https).
        url: String,
    },

    /// Show the config file path and effective settings.
    Config,
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Fetch {
                urls,
                audio,
                quality,
                output_dir,
                jobs,
            } => {
                let opts = FetchOptions {
                    audio,
                    quality,
                    output_dir,
                    jobs,
                };
                run_fetch(&cfg, &urls, opts).await?
            }
            CliCommand::Probe { url } => run_probe(&cfg, &url).await?,
            CliCommand::Config => run_config(&cfg)?,
        }

        Ok(())
    }
}
