//! Error types for the agent core.

use std::path::PathBuf;

use thiserror::Error;

/// Failures that stop the agent before any sampler starts.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("network interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("no usable network interface found")]
    NoInterface,

    #[error("cannot create session directory {path}: {source}")]
    SessionDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open {path}: {source}")]
    SessionFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("building HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// A process that could not report its I/O counters this tick.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("process {pid}: I/O counters unavailable")]
pub struct ProcessIoError {
    pub pid: u32,
}

/// Failure of an HTTP-backed collaborator (geo lookup, benchmarks).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Malformed(String),

    #[error("timed out")]
    Timeout,
}
