//! Typed failures and the fatal-diagnostic exits.
//!
//! Config and trace-header problems are reported upward as errors and end
//! the run from `main`. Corruption of the record stream and writer failures
//! terminate immediately: a partially consumed stream cannot be resumed,
//! and the model is only useful when complete.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path}: {message}")]
    Invalid { path: String, message: String },

    #[error("invalid filter pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("not a trace file (bad magic)")]
    BadMagic,

    #[error("unsupported trace format version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated trace file in {0}")]
    Truncated(&'static str),

    #[error("invalid string data in {0}")]
    InvalidString(&'static str),

    #[error("trace {what} index {index} is out of range")]
    IndexOutOfRange { what: &'static str, index: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The record stream violated an invariant. The in-memory model is no
/// longer trustworthy, so the process terminates.
pub fn fatal_corruption(context: &str) -> ! {
    log::error!("corrupted record stream: {context}");
    std::process::exit(2);
}

/// A database write failed. Partial state is acceptable, continuing is not.
pub fn storage_failure(context: &str, err: &rusqlite::Error) -> ! {
    log::error!("database write failed in {context}: {err}");
    std::process::exit(3);
}
