//! Error taxonomy for the sync core.
//!
//! Everything below the mutation API is recoverable. The variants mirror the
//! wire-level `reason` strings so a client can map a refusal straight back to
//! the recovery policy it implies (retry, force-sync, drop, stop the queue).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Socket closed, HTTP 5xx, DNS failure. Retry with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server already holds a newer revision. Treated as success by the
    /// client, followed by a force-sync.
    #[error("stale write")]
    Stale,

    /// The record id is in the tombstone set. The write is dropped.
    #[error("record was deleted")]
    Tombstoned,

    /// Signature or date verification failed.
    #[error("bad signature")]
    BadSignature,

    /// The peer is not (or no longer) admitted to the instance.
    #[error("not admitted to this event")]
    Forbidden,

    /// Request-code lookup failed.
    #[error("incorrect code")]
    IncorrectCode,

    /// Payload parse failure. Non-retryable; log and drop.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Server-side failure. Generic retry.
    #[error("server error: {0}")]
    Server(String),

    /// Local storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Two envelopes claiming the same id disagree on an immutable key.
    #[error("immutable field `{0}` diverges between replicas")]
    ImmutableDivergence(String),

    /// A field name that the record type does not carry.
    #[error("unknown field `{0}`")]
    UnknownField(String),

    /// Key material could not be loaded or decoded.
    #[error("key error: {0}")]
    Key(String),
}

impl Error {
    /// Whether the operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Server(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Malformed(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
