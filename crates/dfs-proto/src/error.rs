//! Error types for the replicated file store.
//!
//! Client-visible failures map onto the protocol's error tokens through
//! [`DfsError::reply`]; the remaining variants stay internal and are logged.

use crate::constants::{
    ERROR_FILE_ALREADY_EXISTS, ERROR_FILE_DOES_NOT_EXIST, ERROR_LOAD, ERROR_NOT_ENOUGH_DSTORES,
};

/// Unified error type for all file store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum DfsError {
    // Protocol / client-visible
    #[error("malformed or unexpected message")]
    Protocol,
    #[error("not enough dstores joined")]
    NotEnoughDstores,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("file exceeds the maximum size")]
    FileTooLarge,
    #[error("file does not exist")]
    FileDoesNotExist,
    #[error("no replica left to load from")]
    LoadExhausted,

    // Operation outcomes
    #[error("operation timed out")]
    Timeout,
    #[error("peer unavailable")]
    PeerUnavailable,

    // Placement engine
    #[error("hash ring consistency fault")]
    ConsistencyFault,
    #[error("hash ring initialization fault")]
    InitializationFault,

    // Plumbing
    #[error("network error")]
    NetworkError,
    #[error("I/O error")]
    Eio,
    #[error("system error")]
    SystemError,
}

impl DfsError {
    /// The wire token sent to a client for this error, if it has one.
    ///
    /// `FileTooLarge` shares the already-exists token.
    pub fn reply(self) -> Option<&'static str> {
        match self {
            Self::NotEnoughDstores => Some(ERROR_NOT_ENOUGH_DSTORES),
            Self::FileAlreadyExists | Self::FileTooLarge => Some(ERROR_FILE_ALREADY_EXISTS),
            Self::FileDoesNotExist => Some(ERROR_FILE_DOES_NOT_EXIST),
            Self::LoadExhausted => Some(ERROR_LOAD),
            _ => None,
        }
    }

    /// Whether this error signals a broken placement invariant.
    pub fn is_fault(self) -> bool {
        matches!(self, Self::ConsistencyFault | Self::InitializationFault)
    }
}

/// Result type alias for file store operations.
pub type DfsResult<T> = Result<T, DfsError>;

impl From<std::io::Error> for DfsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => DfsError::FileDoesNotExist,
            std::io::ErrorKind::TimedOut => DfsError::Timeout,
            _ => DfsError::Eio,
        }
    }
}
