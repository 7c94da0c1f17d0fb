//! Crate-wide startup error type.
//!
//! Call failures never travel through this: a call's story lives in
//! its `TestOutcome`. This enum covers the fatal conditions that
//! prevent a run from starting at all.

use thiserror::Error;

/// Fatal startup errors; all map to a non-zero exit code.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    PidFile(#[from] crate::pidfile::PidFileError),

    #[error(transparent)]
    Cache(#[from] crate::operator_cache::CacheError),

    #[error("CDR source: {0}")]
    Cdr(#[from] crate::cdr::CdrError),

    #[error("sink: {0}")]
    Sink(#[from] crate::sinks::SinkError),

    #[error(transparent)]
    Pool(#[from] crate::pool::PoolError),

    #[error("directory: {0}")]
    Directory(#[from] crate::directory::DirectoryError),

    #[error("invalid destination {spec:?}: {reason}")]
    BadDestination { spec: String, reason: String },
}
