//! Tracing subscriber setup for the CLI and daemon.
//!
//! Logs go to stderr so that `--json` search output on stdout stays clean.
//! The filter is read from `SERCHA_LOG`, then `RUST_LOG`, and otherwise
//! defaults to `info` for the sercha crates (`debug` with `--verbose`).

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const LOG_ENV: &str = "SERCHA_LOG";

pub fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "sercha=debug,sercha_core=debug,warn"
    } else {
        "sercha=info,sercha_core=info,warn"
    }
}

fn build_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(verbose: bool, json: bool) -> Result<()> {
    let registry = Registry::default().with(build_filter(verbose));
    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbose),
            )
            .try_init()?;
    }
    tracing::debug!(json, "logging initialized");
    Ok(())
}
