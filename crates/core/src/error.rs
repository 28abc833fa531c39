//! Core error types

use thiserror::Error;

/// Core error type for CareChain
#[derive(Debug, Error)]
pub enum CoreError {
    /// A Merkle tree was requested over an empty leaf set
    #[error("Invalid batch: cannot build Merkle tree from empty leaves")]
    InvalidBatch,

    /// Proof requested for a leaf outside the tree
    #[error("Invalid leaf index: {index} (tree has {count} leaves)")]
    InvalidLeafIndex { index: usize, count: usize },

    /// Structurally malformed proof
    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    /// Value is not a well-formed digest
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Envelope could not be decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Payload could not be serialized for hashing or transport
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Receipt store failure
    #[cfg(feature = "sqlite")]
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Validation failures are never worth retrying
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidBatch
                | CoreError::InvalidLeafIndex { .. }
                | CoreError::InvalidProof(_)
                | CoreError::InvalidDigest(_)
        )
    }
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
