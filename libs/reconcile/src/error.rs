//! Error types for the reconciliation engine.
//!
//! Errors are scoped to the component that produces them. Per-key errors
//! (table writes, malformed deliveries) never escape that key's convergence
//! path; only [`InitError`] is fatal to the process.

use lifter_addr::{AddrError, ServiceKey};
use thiserror::Error;

/// Failure kind of a table operation, used for metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableErrorKind {
    Transient,
    CapacityExceeded,
    Unavailable,
}

impl TableErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Errors from the external service table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    /// The write failed for a reason that may clear on retry.
    #[error("transient table error: {0}")]
    Transient(String),

    /// The table is full; the pair was not written.
    #[error("table capacity exceeded ({capacity} entries)")]
    CapacityExceeded { capacity: usize },

    /// The table cannot be reached at all.
    #[error("table unavailable: {0}")]
    Unavailable(String),
}

impl TableError {
    pub fn kind(&self) -> TableErrorKind {
        match self {
            Self::Transient(_) => TableErrorKind::Transient,
            Self::CapacityExceeded { .. } => TableErrorKind::CapacityExceeded,
            Self::Unavailable(_) => TableErrorKind::Unavailable,
        }
    }

    /// Returns true if retrying within the same pass can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::CapacityExceeded { .. })
    }
}

/// Errors from the membership event source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be reached.
    #[error("event source unreachable: {0}")]
    Unreachable(String),

    /// The source answered with something we could not decode.
    #[error("invalid event source response: {0}")]
    InvalidResponse(String),

    /// The subscription has ended.
    #[error("event source subscription closed")]
    Closed,
}

/// A raw notification that could not be normalized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedEvent {
    /// The notification carries no service key.
    #[error("notification is missing its service key")]
    MissingKey,

    /// The service key does not parse.
    #[error("bad service key: {0}")]
    BadKey(AddrError),

    /// The notification kind is missing or not one we understand.
    #[error("unrecognized notification kind for {key}")]
    UnknownKind { key: ServiceKey },

    /// A backend address does not parse.
    #[error("bad backend address for {key}: {source}")]
    BadBackend {
        key: ServiceKey,
        #[source]
        source: AddrError,
    },
}

/// Fatal startup errors.
#[derive(Debug, Error)]
pub enum InitError {
    /// The table could not be listed.
    #[error("cannot open service table: {0}")]
    Table(#[from] TableError),

    /// The event source snapshot could not be fetched.
    #[error("cannot reach event source: {0}")]
    Source(#[from] SourceError),
}
