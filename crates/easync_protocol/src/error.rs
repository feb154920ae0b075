//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting protocol values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A synckey that is neither `"0"` nor `{guid}counter`.
    #[error("invalid sync key: {0:?}")]
    InvalidSyncKey(String),

    /// An unknown collection class name.
    #[error("unknown collection class: {0}")]
    UnknownClass(String),

    /// A numeric status or type code outside the known range.
    #[error("unknown {kind} code: {code}")]
    UnknownCode {
        /// What kind of code was being decoded.
        kind: &'static str,
        /// The offending value.
        code: i64,
    },
}
