//! Minimal MarkLogic REST client with a batched query facility.
//!
//! The crate has two layers:
//! - [`client::DatabaseClient`] talks to the `/v1/search` and `/v1/documents` endpoints.
//! - [`batcher::HttpQueryBatcher`] partitions the URIs matching a query into fixed-size batches,
//!   fetches them concurrently and hands every batch to a [`batcher::BatchListener`].
//!
//! Transient failures (connection errors, timeouts, 5xx) are retried per batch with an
//! exponential backoff, everything else aborts the job.

/// Connection and retry configuration.
pub mod config;

/// REST endpoints used by the batcher.
pub mod client;

/// Batched query execution.
pub mod batcher;

/// Documents and metadata returned by the database.
pub mod document;

/// Exponential backoff used for per-batch retries.
pub mod retry;

/// In-process fakes of the REST API and the batcher, for tests of this crate and its users.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use batcher::{
    BatchListener, HttpQueryBatcher, JobConfig, JobReport, QueryBatch, QueryBatcher,
};
pub use client::{DatabaseClient, SearchPage, SearchQuery};
pub use config::{BasicAuth, ClientConfig, Scheme};
pub use document::{DocumentFormat, DocumentMetadata, DocumentRecord, ReadCategories};
pub use retry::RetryConfig;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport Error - {0}")]
    Transport(String),

    #[error("Server Error - status={status}, {message}")]
    Server { status: u16, message: String },

    #[error("Unauthorized - status={status}, {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Query rejected - status={status}, {message}")]
    Rejected { status: u16, message: String },

    #[error("Failed to decode response - {0}")]
    Decode(String),

    #[error("Batch listener failed - {0}")]
    Listener(String),

    #[error("Job was cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Server { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Error::Decode(value.to_string())
        } else {
            Error::Transport(value.to_string())
        }
    }
}
