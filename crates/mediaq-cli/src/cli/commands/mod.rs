//! CLI command handlers, one file per command.

mod config;
mod fetch;
mod probe;

pub use config::run_config;
pub use fetch::{run_fetch, FetchOptions};
pub use probe::run_probe;

use anyhow::{bail, Context, Result};

/// Accepts only absolute http(s) URLs; returns the normalized form.
pub(crate) fn parse_target(raw: &str) -> Result<String> {
    let url = url::Url::parse(raw.trim()).with_context(|| format!("invalid URL: {raw}"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => bail!("unsupported URL scheme '{other}': {raw}"),
    }
    if url.host_str().is_none() {
        bail!("URL has no host: {raw}");
    }
    Ok(url.to_string())
}
