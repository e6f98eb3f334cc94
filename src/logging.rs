//! Tracing setup shared by the binaries.

use std::fmt;
use std::str::FromStr;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{fmt as tfmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Output layers sit above the level filter, so they need no filtering of their own.
type Output = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Builds the subscriber without installing it: `RUST_LOG` filter (default
/// `info`), stderr output in the configured format, and a daily-rolling JSON
/// file when `log_dir` is set.
pub fn subscriber(config: &ClientConfig) -> (impl Subscriber + Send + Sync, Option<WorkerGuard>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut outputs: Vec<Output> = Vec::new();
    outputs.push(match config.log_format {
        LogFormat::Json => tfmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Pretty => tfmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    });

    let guard = config.log_dir.as_ref().map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "featurevote.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        outputs.push(tfmt::layer().json().with_ansi(false).with_writer(writer).boxed());
        guard
    });

    (tracing_subscriber::registry().with(filter).with(outputs), guard)
}

/// Installs `subscriber(config)` as the global default.
///
/// Keep the returned guard alive for as long as file logs should be flushed.
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init(config: &ClientConfig) -> Option<WorkerGuard> {
    let (subscriber, guard) = subscriber(config);
    if let Err(e) = subscriber.try_init() {
        eprintln!("tracing subscriber already installed: {e}");
    }
    guard
}
