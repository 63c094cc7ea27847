//! Log initialization and setup
//!
//! All quarry commands log through [`tracing`]; this crate installs the global subscriber that
//! formats and filters the events, configured through the [`cli::LoggingConfig`] flags.
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod cli;

pub use cli::{LogDestination, LogFormat};

use std::io;

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::{
    filter::ParseError,
    fmt::{self, writer::BoxMakeWriter, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid log filter '{filter}': {source}")]
    InvalidLogFilter {
        filter: String,
        #[source]
        source: ParseError,
    },

    #[error("Cannot set global tracing subscriber: {0}")]
    SetGlobalDefault(#[from] TryInitError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builder for the log layer.
pub struct Builder {
    log_format: LogFormat,
    log_filter: Option<String>,
    // used when log_filter is none.
    default_log_filter: String,
    make_writer: BoxMakeWriter,
    with_ansi: bool,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("log_format", &self.log_format)
            .field("log_filter", &self.log_filter)
            .field("default_log_filter", &self.default_log_filter)
            .field("with_ansi", &self.with_ansi)
            .finish_non_exhaustive()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Full,
            log_filter: None,
            default_log_filter: Self::DEFAULT_LOG_FILTER.to_owned(),
            make_writer: BoxMakeWriter::new(io::stderr),
            with_ansi: true,
        }
    }
}

impl Builder {
    pub const DEFAULT_LOG_FILTER: &'static str = "info";

    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log filter using a simple numeric "verbosity level".
    ///
    /// 0 means, keep existing `log_filter` value.
    pub fn with_log_verbose_count(self, log_verbose_count: u8) -> Self {
        let log_filter = match log_verbose_count {
            0 => self.log_filter,
            1 => Some("info".to_owned()),
            2 => Some("debug,h2=info,hyper=info,sqlx=info".to_owned()),
            _ => Some("trace,h2=info,hyper=info,sqlx=info".to_owned()),
        };
        Self { log_filter, ..self }
    }

    pub fn with_log_filter(self, log_filter: Option<&str>) -> Self {
        Self {
            log_filter: log_filter.map(ToOwned::to_owned),
            ..self
        }
    }

    pub fn with_default_log_filter(self, default_log_filter: impl Into<String>) -> Self {
        Self {
            default_log_filter: default_log_filter.into(),
            ..self
        }
    }

    pub fn with_log_format(self, log_format: LogFormat) -> Self {
        Self { log_format, ..self }
    }

    pub fn with_log_destination(self, log_destination: LogDestination) -> Self {
        let make_writer = match log_destination {
            LogDestination::Stdout => BoxMakeWriter::new(io::stdout),
            LogDestination::Stderr => BoxMakeWriter::new(io::stderr),
        };
        Self {
            make_writer,
            ..self
        }
    }

    pub fn with_writer<W>(self, make_writer: W) -> Self
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        Self {
            make_writer: BoxMakeWriter::new(make_writer),
            ..self
        }
    }

    /// Enable/disable ANSI encoding for formatted events (i.e. colors).
    ///
    /// Defaults to true.
    pub fn with_ansi(self, with_ansi: bool) -> Self {
        Self { with_ansi, ..self }
    }

    /// Build the filtered log layer.
    pub fn build_layer<S>(self) -> Result<Box<dyn Layer<S> + Send + Sync + 'static>>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let filter = self.log_filter.unwrap_or(self.default_log_filter);
        let env_filter =
            EnvFilter::try_new(&filter).map_err(|source| Error::InvalidLogFilter {
                filter: filter.clone(),
                source,
            })?;

        let layer = match self.log_format {
            LogFormat::Full => fmt::layer()
                .with_writer(self.make_writer)
                .with_ansi(self.with_ansi)
                .with_filter(env_filter)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(self.make_writer)
                .with_ansi(self.with_ansi)
                .with_filter(env_filter)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(self.make_writer)
                .with_filter(env_filter)
                .boxed(),
        };
        Ok(layer)
    }

    /// Build the log layer and install it as the global subscriber.
    pub fn install_global(self) -> Result<()> {
        let layer = self.build_layer()?;
        tracing_subscriber::registry().with(layer).try_init()?;
        Ok(())
    }
}
