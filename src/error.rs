use thiserror::Error;

use crate::store::StoreError;

/// Repository error type
///
/// Every variant carries the storage key involved, and the operation name
/// where more than one operation can produce it. Nothing at this layer
/// retries; callers decide.
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Store unavailable during {op} on {key}: {source}")]
    StoreUnavailable {
        op: &'static str,
        key: String,
        source: StoreError,
    },

    #[error("User not found: {key}")]
    NotFound { key: String },

    #[error("Serialization error during {op} on {key}: {source}")]
    Encode {
        op: &'static str,
        key: String,
        source: bincode::error::EncodeError,
    },

    #[error("Deserialization error during {op} on {key}: {source}")]
    Decode {
        op: &'static str,
        key: String,
        source: bincode::error::DecodeError,
    },

    #[error("Transaction aborted during {op} on {key}: {source}")]
    TransactionAborted {
        op: &'static str,
        key: String,
        source: StoreError,
    },

    #[error("ID allocation failed on {key}: {source}")]
    IdAllocation { key: String, source: StoreError },

    #[error("Index entry {key} has no stored value")]
    Orphaned { key: String },
}

/// Coarse classification callers map to their own responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backing store could not be reached or failed mid-operation
    StoreUnavailable,
    /// No value at the derived key
    NotFound,
    /// Payload could not be encoded or decoded
    Serialization,
    /// Atomic batch was discarded, nothing from it took effect
    TransactionAborted,
    /// Index and values disagree (orphaned index entry)
    Inconsistent,
}

impl RepoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepoError::StoreUnavailable { .. } | RepoError::IdAllocation { .. } => {
                ErrorKind::StoreUnavailable
            }
            RepoError::NotFound { .. } => ErrorKind::NotFound,
            RepoError::Encode { .. } | RepoError::Decode { .. } => ErrorKind::Serialization,
            RepoError::TransactionAborted { .. } => ErrorKind::TransactionAborted,
            RepoError::Orphaned { .. } => ErrorKind::Inconsistent,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Storage key the failure relates to
    pub fn key(&self) -> &str {
        match self {
            RepoError::StoreUnavailable { key, .. }
            | RepoError::NotFound { key }
            | RepoError::Encode { key, .. }
            | RepoError::Decode { key, .. }
            | RepoError::TransactionAborted { key, .. }
            | RepoError::IdAllocation { key, .. }
            | RepoError::Orphaned { key } => key,
        }
    }

    pub(crate) fn unavailable(op: &'static str, key: impl Into<String>, source: StoreError) -> Self {
        let key = key.into();
        tracing::error!("Store error during {} on {}: {:?}", op, key, source);
        RepoError::StoreUnavailable { op, key, source }
    }

    pub(crate) fn aborted(op: &'static str, key: impl Into<String>, source: StoreError) -> Self {
        let key = key.into();
        tracing::warn!("Transaction aborted during {} on {}: {}", op, key, source);
        RepoError::TransactionAborted { op, key, source }
    }
}

/// Result type alias for repository results
pub type Result<T> = std::result::Result<T, RepoError>;
