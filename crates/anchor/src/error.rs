//! Anchoring runtime errors

use crate::ledger::LedgerError;
use carechain_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnchorError {
    /// Hashing, tree building, encoding or persistence failed locally
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Anchoring failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Batch channel closed")]
    ChannelClosed,

    #[error("Service is shutting down")]
    Shutdown,
}

impl AnchorError {
    /// Only transient ledger conditions are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnchorError::Ledger(e) if e.is_transient())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AnchorError::Core(e) if e.is_validation())
    }
}

pub type Result<T> = std::result::Result<T, AnchorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(AnchorError::from(LedgerError::Busy("429".into())).is_retryable());
        assert!(AnchorError::from(LedgerError::Unavailable("down".into())).is_retryable());
        assert!(!AnchorError::from(LedgerError::Rejected("bad".into())).is_retryable());
        assert!(!AnchorError::from(CoreError::InvalidBatch).is_retryable());
        assert!(AnchorError::from(CoreError::InvalidBatch).is_validation());
    }
}
