//! Process-wide log sink configuration.
//!
//! Library code only emits through `tracing` macros. Applications call
//! [`configure_logging`] once to install a subscriber.

use std::str::FromStr;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::{NxError, Result};

/// Severity threshold, lowest to highest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogSeverity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogSeverity {
    /// `tracing` has no fatal level; fatal maps to error.
    pub fn level_filter(self) -> LevelFilter {
        match self {
            LogSeverity::Trace => LevelFilter::TRACE,
            LogSeverity::Debug => LevelFilter::DEBUG,
            LogSeverity::Info => LevelFilter::INFO,
            LogSeverity::Warning => LevelFilter::WARN,
            LogSeverity::Error | LogSeverity::Fatal => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogSeverity {
    type Err = NxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogSeverity::Trace),
            "debug" => Ok(LogSeverity::Debug),
            "info" => Ok(LogSeverity::Info),
            "warn" | "warning" => Ok(LogSeverity::Warning),
            "error" => Ok(LogSeverity::Error),
            "fatal" => Ok(LogSeverity::Fatal),
            other => Err(NxError::InvalidParameter(format!(
                "unknown log severity '{other}'"
            ))),
        }
    }
}

/// Install a global fmt subscriber.
///
/// Standard output and the debug sink (stderr, without ANSI colouring) are
/// toggled independently. `RUST_LOG` directives, when present, refine the
/// threshold. Fails if a global subscriber is already installed.
pub fn configure_logging(
    print_to_standard_output: bool,
    print_to_debug_output: bool,
    severity: LogSeverity,
) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(severity.level_filter().into())
        .from_env_lossy();

    let stdout = print_to_standard_output.then(|| fmt::layer().with_writer(std::io::stdout));
    let debug = print_to_debug_output.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(debug)
        .try_init()
        .map_err(|e| NxError::Logging(e.to_string()))
}
