use anyhow::anyhow;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter};

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

/// The command that owns the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSurface {
    /// Long-running `serve`: one JSON line per event, with the enclosing
    /// `proxy.exchange` span attached.
    Proxy,
    /// One-shot `summarize`: terse human-readable lines next to the report.
    Summarizer,
}

impl LogSurface {
    fn default_format(self) -> LogFormat {
        match self {
            Self::Proxy => LogFormat::Json,
            Self::Summarizer => LogFormat::Pretty,
        }
    }
}

/// Installs the global subscriber. Diagnostics go to stderr so `summarize`
/// output on stdout stays clean.
pub fn init(
    config: &Config,
    surface: LogSurface,
    cli_level_override: Option<&str>,
) -> anyhow::Result<()> {
    let log_level = resolve_log_level(config, cli_level_override)?;
    let format = resolve_log_format(config, surface);
    let subscriber = build_subscriber(log_level, format, surface, std::io::stderr);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

fn build_subscriber<W>(
    level: LevelFilter,
    format: LogFormat,
    surface: LogSurface,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(writer);
    match (format, surface) {
        (LogFormat::Json, _) => Box::new(
            builder
                .with_target(true)
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .finish(),
        ),
        (LogFormat::Pretty, LogSurface::Proxy) => {
            Box::new(builder.with_target(true).pretty().finish())
        }
        (LogFormat::Pretty, LogSurface::Summarizer) => Box::new(
            builder
                .with_target(false)
                .without_time()
                .compact()
                .finish(),
        ),
    }
}

fn resolve_log_level(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = cli_level_override
        .or_else(|| {
            config
                .logging
                .as_ref()
                .and_then(|logging| logging.level.as_deref())
        })
        .unwrap_or(DEFAULT_LOG_LEVEL);

    raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })
}

fn resolve_log_format(config: &Config, surface: LogSurface) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or_else(|| surface.default_format())
}
