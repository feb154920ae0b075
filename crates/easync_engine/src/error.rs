//! Error types for the session engine.

use easync_protocol::{PingStatus, ProtocolError, SyncStatus};
use easync_state::StateError;
use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors a backend driver reports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The item does not exist (any more).
    #[error("item not found: {0}")]
    NotFound(String),

    /// The folder does not exist (any more).
    #[error("folder gone: {0}")]
    FolderGone(String),

    /// The baseline is too old to diff against.
    #[error("stale state for folder {0}")]
    StaleState(String),

    /// Transient backend failure.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while serving a device session.
///
/// Expected outcomes of a round are distinct variants so callers can
/// branch on them; nothing here is meant to reach a client unmapped, see
/// [`EngineError::status`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The synckey or folder state the client refers to no longer exists.
    #[error("sync state gone for collection {collection}")]
    StateGone {
        /// Collection id.
        collection: String,
    },

    /// The backend folder disappeared; the hierarchy must be resynchronized.
    #[error("folder gone: {0}")]
    FolderGone(String),

    /// The client misused the protocol.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The backend cannot diff against the client's baseline.
    #[error("stale state for collection {0}")]
    StaleState(String),

    /// Another request advanced the session clocks since this one loaded it.
    #[error("stale session: another request owns this device session")]
    StaleSession,

    /// Generic backend failure.
    #[error("backend error: {0}")]
    Backend(BackendError),

    /// State store failure.
    #[error("state store error: {0}")]
    State(StateError),

    /// Malformed protocol value.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A collection the operation needs is not in the working set.
    #[error("missing collection data: {0}")]
    MissingCollection(String),
}

impl EngineError {
    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Returns true if this error invalidates the whole session round
    /// rather than a single collection.
    pub fn is_session_wide(&self) -> bool {
        matches!(self, EngineError::FolderGone(_) | EngineError::StaleSession)
    }

    /// Translates the error to the nearest SYNC status.
    pub fn status(&self) -> SyncStatus {
        match self {
            EngineError::StateGone { .. } | EngineError::StaleState(_) => {
                SyncStatus::InvalidSyncKey
            }
            EngineError::FolderGone(_) => SyncStatus::FolderHierarchyChanged,
            EngineError::InvalidRequest(_) => SyncStatus::ProtocolError,
            EngineError::StaleSession => SyncStatus::Retry,
            EngineError::Protocol(ProtocolError::InvalidSyncKey(_)) => SyncStatus::InvalidSyncKey,
            EngineError::Protocol(_) => SyncStatus::ProtocolError,
            EngineError::Backend(_) | EngineError::State(_) | EngineError::MissingCollection(_) => {
                SyncStatus::ServerError
            }
        }
    }
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::FolderGone(folder) => EngineError::FolderGone(folder),
            BackendError::StaleState(folder) => EngineError::StaleState(folder),
            other => EngineError::Backend(other),
        }
    }
}

impl From<StateError> for EngineError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::StateNotFound { collection, .. } => EngineError::StateGone { collection },
            other => EngineError::State(other),
        }
    }
}

/// Why a long poll ended without a result.
///
/// The numeric codes match the sentinels PING and looping SYNC handlers
/// branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CollectionError {
    /// The hierarchy must be resynchronized (folder gone, wipe pending).
    #[error("folder sync required")]
    FolderSyncRequired,

    /// Server-side failure or invalid poll input.
    #[error("server error")]
    Server,

    /// Another request took over the session.
    #[error("stale request")]
    Stale,

    /// The client must send a full SYNC first.
    #[error("sync required")]
    SyncRequired,
}

impl CollectionError {
    /// Returns the negative sentinel code.
    pub fn code(&self) -> i32 {
        match self {
            CollectionError::FolderSyncRequired => -1,
            CollectionError::Server => -2,
            CollectionError::Stale => -3,
            CollectionError::SyncRequired => -4,
        }
    }

    /// Returns the PING status to answer with, or `None` when the request
    /// must end without a response body.
    pub fn ping_status(&self) -> Option<PingStatus> {
        match self {
            CollectionError::FolderSyncRequired => Some(PingStatus::FolderSyncRequired),
            CollectionError::Server => Some(PingStatus::ServerError),
            CollectionError::SyncRequired => Some(PingStatus::MissingParameters),
            CollectionError::Stale => None,
        }
    }

    /// Returns the SYNC status to answer with, or `None` when the request
    /// must end without a response body.
    pub fn sync_status(&self) -> Option<SyncStatus> {
        match self {
            CollectionError::FolderSyncRequired => Some(SyncStatus::FolderHierarchyChanged),
            CollectionError::Server => Some(SyncStatus::ServerError),
            CollectionError::SyncRequired => Some(SyncStatus::RequestIncomplete),
            CollectionError::Stale => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_errors_map_to_state_gone() {
        let err: EngineError = StateError::StateNotFound {
            collection: "c1".into(),
            synckey: "{a}1".into(),
        }
        .into();
        assert!(matches!(err, EngineError::StateGone { ref collection } if collection == "c1"));
        assert_eq!(err.status(), SyncStatus::InvalidSyncKey);

        let err: EngineError = StateError::Corrupted("bad".into()).into();
        assert_eq!(err.status(), SyncStatus::ServerError);
    }

    #[test]
    fn backend_errors_are_classified() {
        let err: EngineError = BackendError::FolderGone("INBOX".into()).into();
        assert!(err.is_session_wide());
        assert_eq!(err.status(), SyncStatus::FolderHierarchyChanged);

        let err: EngineError = BackendError::StaleState("INBOX".into()).into();
        assert!(!err.is_session_wide());
        assert!(matches!(err, EngineError::StaleState(_)));

        let err: EngineError = BackendError::Unavailable("down".into()).into();
        assert!(matches!(err, EngineError::Backend(_)));
        assert_eq!(err.status(), SyncStatus::ServerError);
    }

    #[test]
    fn staleness_is_session_wide() {
        assert!(EngineError::StaleSession.is_session_wide());
        assert!(!EngineError::invalid_request("ping before sync").is_session_wide());
    }

    #[test]
    fn collection_error_codes() {
        assert_eq!(CollectionError::FolderSyncRequired.code(), -1);
        assert_eq!(CollectionError::Server.code(), -2);
        assert_eq!(CollectionError::Stale.code(), -3);
        assert_eq!(CollectionError::SyncRequired.code(), -4);
        assert_eq!(CollectionError::Stale.ping_status(), None);
        assert_eq!(
            CollectionError::FolderSyncRequired.ping_status(),
            Some(PingStatus::FolderSyncRequired)
        );
        assert_eq!(
            CollectionError::SyncRequired.sync_status(),
            Some(SyncStatus::RequestIncomplete)
        );
    }
}
