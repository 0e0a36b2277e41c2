//! Error taxonomy for the harvesting pipeline.
//!
//! Every fallible operation in the connectors, the replay cache, and the
//! sync engine reports one of these variants. Read-path failures of an
//! index store are *not* errors: they degrade to empty results (see
//! [`crate::store::IndexStore`]).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    /// An identity field was missing, empty, or not a string.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Cache requested but unavailable, corrupt, or exhausted mid-replay.
    #[error("cache error: {0}")]
    Cache(String),

    /// A raw payload did not match the shape its connector expects.
    #[error("parse error: {0}")]
    Parse(String),

    /// Connector-level setup failure.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("{0} is not a valid date")]
    InvalidDate(String),

    /// Network failure after the HTTP layer gave up retrying.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The index store rejected a write.
    #[error("store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HarvestError>;
