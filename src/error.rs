//! Error taxonomy for the indexing pipeline and API surface.
//!
//! Errors fall into classes that drive behavior at the queue and HTTP
//! boundaries:
//!
//! | Class | Queue behavior | HTTP status |
//! |-------|----------------|-------------|
//! | [`Error::Validation`] | never enqueued | 400 |
//! | [`Error::NotFound`] | fatal, no retry | 404 |
//! | [`Error::Transient`] | retried with backoff | 503 |
//! | [`Error::Fatal`] | fails immediately | 500 |
//!
//! [`Error::Unauthorized`] only occurs at the API boundary; the pipeline
//! never sees it. [`Error::is_retryable`] is the single place the queue
//! consults when deciding whether a failed attempt gets another run.

use thiserror::Error;

/// Pipeline and API error with retry classification.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input rejected synchronously (bad MIME type, oversized upload,
    /// empty content, malformed metadata, mutually-exclusive history modes).
    #[error("{0}")]
    Validation(String),

    /// Unknown document / job / profile / conversation id.
    #[error("{0} not found")]
    NotFound(String),

    /// Provider timeout, rate limit, or store connection blip. The job
    /// transitions to a delayed retry per the backoff policy.
    #[error("transient: {0}")]
    Transient(String),

    /// Unsupported file type, unknown embedding model, missing reindex
    /// target. Not retried; the job fails terminally on first occurrence.
    #[error("{0}")]
    Fatal(String),

    /// Session could not be resolved from request headers.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the queue should schedule another attempt after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            // Store blips are retryable the same way provider blips are.
            Error::Db(_) => true,
            Error::Validation(_)
            | Error::NotFound(_)
            | Error::Fatal(_)
            | Error::Unauthorized(_)
            | Error::Json(_) => false,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
