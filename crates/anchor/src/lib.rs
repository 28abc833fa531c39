//! CareChain anchoring runtime.
//!
//! Turns clinical events into ledger anchors. Events are hashed locally, either
//! submitted one by one or aggregated into Merkle-rooted batches, compressed into the
//! wire envelope, rate limited, submitted, retried on transient failure, and finally
//! recorded as receipts. Verification replays the same steps in reverse.

pub mod aggregator;
pub mod error;
pub mod ledger;
pub mod limiter;
pub mod message;
pub mod queue;
pub mod service;
pub mod submit;
pub mod verify;

pub use aggregator::{AggregatorStats, BatchAggregator, ItemTicket};
pub use error::{AnchorError, Result};
pub use ledger::{
    LedgerClient, LedgerError, MemoryLedger, SubmitReceipt, TopicMessage, TransactionRecord,
    TransactionStatus,
};
pub use limiter::{LimiterStats, RateLimiter};
pub use message::{committed_digest, AnchorMessage, MessageKind};
pub use queue::{AnchoringQueue, Completion, QueueEntry, QueueStats, QueueStatus, Submitter};
pub use service::{AnchorOutcome, AnchorService, ServiceStats};
pub use submit::LedgerSubmitter;
pub use verify::{VerificationReport, VerificationService, VerificationStatus};
