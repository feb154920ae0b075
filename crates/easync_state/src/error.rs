//! Error types for state store operations.

use std::io;
use thiserror::Error;

/// Result type for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while reading or writing sync state.
#[derive(Debug, Error)]
pub enum StateError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No state is stored for a previously issued synckey.
    #[error("sync state not found for collection {collection} at synckey {synckey}")]
    StateNotFound {
        /// Collection id.
        collection: String,
        /// The synckey that was looked up.
        synckey: String,
    },

    /// A device id, user or collection id cannot be used as a store key.
    #[error("invalid store key: {0:?}")]
    InvalidKey(String),

    /// The stored data is corrupted.
    #[error("state corrupted: {0}")]
    Corrupted(String),
}

impl StateError {
    /// Returns true if this error means the client's baseline no longer exists.
    pub fn is_state_gone(&self) -> bool {
        matches!(self, StateError::StateNotFound { .. })
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}
