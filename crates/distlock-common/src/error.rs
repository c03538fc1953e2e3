//! Error types and error codes for the lock catalog
//!
//! This module defines:
//! - `CatalogError`: every failure a catalog operation can report
//! - `ErrorCode`: structured codes, numerically compatible with the
//!   document store's own error codes where one exists

use serde::{Deserialize, Serialize};

/// Failures reported by lock catalog operations.
///
/// "Matched nothing" is deliberately absent: a lock that is busy, already
/// released or already overtaken is a valid outcome, not an error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// No node satisfying the read preference could be resolved.
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    /// The round trip to the node failed before a reply was received.
    #[error("network error: {0}")]
    Transport(String),

    /// The store rejected the command outright.
    #[error("command failed: code={code}, message={message}")]
    CommandFailed {
        code: i32,
        code_name: Option<String>,
        message: String,
    },

    /// The write applied on the primary but was not acknowledged by enough
    /// replicas before the write concern timeout.
    #[error("write concern not satisfied: {0}")]
    WriteConcernFailed(String),

    /// The reply did not have the expected shape.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A returned document could not be decoded into the expected entity.
    #[error("failed to parse: {0}")]
    FailedToParse(String),

    #[error("lock not found: {0}")]
    LockNotFound(String),

    #[error("no matching document: {0}")]
    NoMatchingDocument(String),
}

impl CatalogError {
    /// Numeric code of this error. Command failures keep the store's code.
    pub fn code(&self) -> i32 {
        match self {
            CatalogError::HostUnreachable(_) => HOST_UNREACHABLE.code,
            CatalogError::Transport(_) => SOCKET_EXCEPTION.code,
            CatalogError::CommandFailed { code, .. } => *code,
            CatalogError::WriteConcernFailed(_) => WRITE_CONCERN_FAILED.code,
            CatalogError::UnsupportedFormat(_) => UNSUPPORTED_FORMAT.code,
            CatalogError::FailedToParse(_) => FAILED_TO_PARSE.code,
            CatalogError::LockNotFound(_) => LOCK_NOT_FOUND.code,
            CatalogError::NoMatchingDocument(_) => NO_MATCHING_DOCUMENT.code,
        }
    }

    /// Whether the store reported a duplicate key violation.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, CatalogError::CommandFailed { code, .. } if *code == DUPLICATE_KEY.code)
    }

    /// Whether the failure happened before the command reached the store.
    ///
    /// Only these are safe to retry blindly; everything else may have been
    /// applied.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            CatalogError::HostUnreachable(_) | CatalogError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Error code structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const HOST_UNREACHABLE: ErrorCode<'static> = ErrorCode {
    code: 6,
    message: "host unreachable",
};

pub const UNKNOWN_ERROR: ErrorCode<'static> = ErrorCode {
    code: 8,
    message: "unknown error",
};

pub const FAILED_TO_PARSE: ErrorCode<'static> = ErrorCode {
    code: 9,
    message: "failed to parse",
};

pub const NO_MATCHING_DOCUMENT: ErrorCode<'static> = ErrorCode {
    code: 47,
    message: "no matching document",
};

pub const WRITE_CONCERN_FAILED: ErrorCode<'static> = ErrorCode {
    code: 64,
    message: "write concern failed",
};

pub const UNSUPPORTED_FORMAT: ErrorCode<'static> = ErrorCode {
    code: 115,
    message: "unsupported format",
};

pub const LOCK_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 142,
    message: "lock not found",
};

pub const SOCKET_EXCEPTION: ErrorCode<'static> = ErrorCode {
    code: 9001,
    message: "socket exception",
};

pub const DUPLICATE_KEY: ErrorCode<'static> = ErrorCode {
    code: 11000,
    message: "duplicate key",
};
