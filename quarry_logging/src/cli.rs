//! Common CLI flags for logging
use clap::ValueEnum;

use crate::{Builder, Result};

/// Rendering of log events, `--log-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable, one line per event.
    Full,
    /// Human-readable, several lines per event.
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Stream log events are written to, `--log-destination`.
///
/// `quarry dispatch` prints its summary on stdout, so logs default to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogDestination {
    Stdout,
    Stderr,
}

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,sqlx=warn` specifies debug logging for all modules
    /// except for the `sqlx` crate which will only display warnings.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug,h2=info,hyper=info,sqlx=info'
    ///
    /// -vvv 'trace,h2=info,hyper=info,sqlx=info'
    #[clap(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        global = true,
    )]
    pub log_verbose_count: u8,

    /// Logs: destination
    #[clap(
        long = "log-destination",
        env = "LOG_DESTINATION",
        value_enum,
        ignore_case = true,
        default_value_t = LogDestination::Stderr,
    )]
    pub log_destination: LogDestination,

    /// Logs: message format
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        value_enum,
        ignore_case = true,
        default_value_t = LogFormat::Full,
    )]
    pub log_format: LogFormat,
}

impl LoggingConfig {
    pub fn to_builder(&self) -> Builder {
        self.with_builder(Builder::new())
    }

    pub fn with_builder(&self, builder: Builder) -> Builder {
        builder
            .with_log_filter(self.log_filter.as_deref())
            // goes after with_log_filter because -v overrides --log-filter
            .with_log_verbose_count(self.log_verbose_count)
            .with_log_destination(self.log_destination)
            .with_log_format(self.log_format)
    }

    pub fn install_global_subscriber(&self) -> Result<()> {
        self.to_builder().install_global()
    }
}
