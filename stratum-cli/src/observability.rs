//! Tracing subscriber setup with format selection.

use anyhow::{Context, Result};
use std::str::FromStr;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line, colored.
    Pretty,
    /// Single line per event.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        })
    }
}

/// How the CLI logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Output format.
    pub log_format: LogFormat,
    /// `EnvFilter` directive string.
    pub log_filter: String,
    /// Tag each line with the emitting thread.
    pub thread_ids: bool,
}

impl TracingConfig {
    /// Derive the configuration from a `-v` count and the environment.
    ///
    /// Environment variables:
    /// - `STRATUM_LOG_FORMAT`: "json", "pretty", or "compact"
    /// - `STRATUM_LOG_LEVEL` or `RUST_LOG`: filter string, overrides `-v`
    /// - `STRATUM_LOG_THREAD_IDS`: "true" or "1" to tag lines with thread ids
    pub fn from_env(verbosity: u8) -> Self {
        let terminal = std::io::IsTerminal::is_terminal(&std::io::stderr());
        Self::resolve(verbosity, terminal, |key| std::env::var(key).ok())
    }

    /// Resolve against an arbitrary variable lookup. Without an explicit
    /// format, terminals get `pretty` and everything else `compact`.
    pub fn resolve(
        verbosity: u8,
        terminal: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let level = match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        let log_format = match lookup("STRATUM_LOG_FORMAT") {
            Some(format) => format.parse().unwrap_or_default(),
            None if terminal => LogFormat::Pretty,
            None => LogFormat::Compact,
        };
        let log_filter = lookup("STRATUM_LOG_LEVEL")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or_else(|| level.to_string());
        let thread_ids =
            lookup("STRATUM_LOG_THREAD_IDS").is_some_and(|s| s == "true" || s == "1");
        Self {
            log_format,
            log_filter,
            thread_ids,
        }
    }
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_ids(config.thread_ids);
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(layer.json().flatten_event(true)).try_init(),
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
    }
    .context("Failed to initialize tracing subscriber")
}
