//! Tracing setup: stdout formatting plus an optional JSON-lines file.

mod json;

pub use json::{JsonLogLayer, JsonLogWriter, JSON_LOG_CAPACITY};

use crate::cli::{LogConfig, DEFAULT_LOG_JSON_FILTER};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guards that must be held to keep logging active.
pub struct TracingGuards {
    pub log_writer: Option<Arc<JsonLogWriter>>,
}

impl TracingGuards {
    /// Flush the JSON log file, if one is open.
    pub fn finish(&self) {
        if let Some(writer) = self.log_writer.as_ref() {
            if let Err(err) = writer.finish() {
                warn!(error = %err, "failed to flush json log");
            }
        }
    }
}

/// Stdout filter for a verbosity level; `RUST_LOG` takes precedence.
pub fn stdout_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_directives(verbosity)))
}

fn verbosity_directives(verbosity: u8) -> String {
    let (global, local) = match verbosity {
        0 => ("warn", "info"),
        1 => ("warn", "debug"),
        2 => ("info", "trace"),
        _ => ("debug", "trace"),
    };
    format!("{global},block_puller={local},block_puller_harness={local}")
}

/// Install the global tracing subscriber.
pub fn init_tracing(config: &LogConfig) -> Result<TracingGuards> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(stdout_filter(config.verbosity));

    let log_writer = config
        .log_json
        .as_ref()
        .map(|path| {
            JsonLogWriter::new(path, JSON_LOG_CAPACITY)
                .map(Arc::new)
                .wrap_err_with(|| format!("failed to open json log {}", path.display()))
        })
        .transpose()?;
    let json_filter = EnvFilter::try_new(&config.log_json_filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_JSON_FILTER));
    let json_layer = log_writer
        .as_ref()
        .map(|writer| JsonLogLayer::new(Arc::clone(writer)).with_filter(json_filter));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(json_layer)
        .try_init()
        .wrap_err("failed to install tracing subscriber")?;

    Ok(TracingGuards { log_writer })
}
