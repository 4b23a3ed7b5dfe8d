//! Error types shared across every module.
///
/// All fallible operations return `Result<T, DbError>`. The taxonomy is
/// deliberately small and closed: callers pattern-match on it rather than
/// parsing messages.
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type DbResult<T> = Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    /// No document with this id exists in the collection.
    #[error("'{id}' not found in collection '{collection}'")]
    NotFound { collection: String, id: String },

    /// A unique index constraint (or similar invariant) was violated.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// A vector passed to an ANN index does not match the index's dimension.
    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Envelope signature did not verify; no plaintext is returned.
    #[error("signature invalid")]
    SignatureInvalid,

    /// Referenced key id is not present in the key store.
    #[error("key missing: {key_id}")]
    KeyMissing { key_id: String },

    /// Referenced key exists but is not usable in its current lifecycle state.
    #[error("key '{key_id}' is {state}")]
    KeyInactive { key_id: String, state: String },

    /// JSON (de)serialization failure.
    #[error("marshal error: {0}")]
    Marshal(#[from] serde_json::Error),

    /// Underlying I/O failure in the storage backend.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Operation attempted before the owning component finished setup.
    #[error("not initialized: {what}")]
    NotInitialized { what: String },

    /// Message addressed to a peer the network manager has no record of.
    #[error("peer unknown: {peer_id}")]
    PeerUnknown { peer_id: String },

    /// Operation was cancelled before completion (shutdown, timeout).
    #[error("cancelled")]
    Cancelled,
}

impl DbError {
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        DbError::Conflict {
            reason: reason.into(),
        }
    }

    pub fn not_initialized(what: impl Into<String>) -> Self {
        DbError::NotInitialized { what: what.into() }
    }
}
