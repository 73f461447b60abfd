//! Tracing subscriber setup for the `labterm` binary.
//!
//! Logs always go to stderr so console output on stdout stays clean.

use std::str::FromStr;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::CliError;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable text.
    #[default]
    Console,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = CliError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "console" | "text" => Ok(Self::Console),
            "json" => Ok(Self::Json),
            other => Err(CliError::Usage(format!("unknown log format {other:?}"))),
        }
    }
}

/// Pick the filter level: every `-v` raises the configured level one step.
pub fn effective_level(configured: &str, verbosity: u8) -> &'static str {
    const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    let base = LEVELS
        .iter()
        .position(|level| level.eq_ignore_ascii_case(configured.trim()))
        .unwrap_or(2);
    let index = (base + usize::from(verbosity)).min(LEVELS.len() - 1);
    LEVELS[index]
}

/// Install the global subscriber. `RUST_LOG` overrides the computed level.
pub fn init_logging(level: &str, format: LogFormat) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("labterm_cli={level},labterm_session={level}"))
    });

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Console => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(level == "trace")
                    .with_line_number(level == "trace"),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.map_err(|err| CliError::Logging(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_level() {
        assert_eq!(effective_level("info", 0), "info");
        assert_eq!(effective_level("info", 1), "debug");
        assert_eq!(effective_level("warn", 9), "trace");
        assert_eq!(effective_level("bogus", 0), "info");
    }

    #[test]
    fn parses_format_aliases() {
        assert_eq!("JSON".parse::<LogFormat>().ok(), Some(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>().ok(), Some(LogFormat::Console));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
