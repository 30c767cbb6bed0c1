//! Error types for each stage of the extractor.
//!
//! Per-job failures ([`FetchError`], [`ParseError`]) never abort a run; the
//! worker turns them into a failed [`crate::models::ExtractionResult`].
//! [`StoreError`], [`ConfigError`] and [`PipelineError`] stop the run.

use reqwest::StatusCode;
use std::io;
use thiserror::Error;

/// Failure while downloading a WARC file.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },

    #[error("I/O error while fetching {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },

    #[error("unsupported source URL: {0}")]
    UnsupportedUrl(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Connection problems, timeouts, `429` and `5xx` responses are
    /// transient; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request() || source.is_body()
            }
            FetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::Io { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            FetchError::UnsupportedUrl(_) | FetchError::Cancelled => false,
        }
    }
}

/// Failure while enumerating jobs.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to download index {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid base URL {url}: {source}")]
    BaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Failure while walking the records of a downloaded WARC file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("I/O error while reading WARC: {0}")]
    Io(#[from] io::Error),

    #[error("malformed WARC record at byte {offset}: {reason}")]
    Malformed { offset: u64, reason: String },

    #[error("parsing cancelled")]
    Cancelled,
}

/// Failure in the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unknown partition key: {0}")]
    UnknownPartition(String),
}

impl StoreError {
    pub fn io(path: impl AsRef<std::path::Path>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure of a whole pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("index stage failed: {0}")]
    Index(#[from] SourceError),

    #[error("worker pool could not be created: {0}")]
    Pool(String),

    #[error("result sink failed: {0}")]
    Sink(#[from] StoreError),

    #[error("result sink task failed: {0}")]
    SinkTask(String),

    #[error("extract stage interrupted by shutdown")]
    Interrupted,

    #[error("publish stage failed: {0}")]
    Publish(#[source] StoreError),
}
