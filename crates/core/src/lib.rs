//! Core functionality for CareChain clinical event anchoring.
//!
//! This crate provides the deterministic building blocks shared by the anchoring
//! runtime, the verification path and the offline tools: canonical hashing, Merkle
//! trees and proofs, the compression codec and wire envelope, configuration, logging
//! and receipt persistence.

pub mod codec;
pub mod config;
pub mod digest;
pub mod error;
pub mod logging;
pub mod merkle;
#[cfg(feature = "sqlite")]
pub mod receipt_store;
pub mod types;

pub use codec::{CompressionCodec, DecodedMessage, Envelope, EnvelopeMeta, ENVELOPE_VERSION};
pub use config::{AnchorConfig, BatchConfig, CompressionConfig, QueueConfig, RateLimitConfig};
pub use digest::{digest, digest_bytes, digest_value, Digest};
pub use error::{CoreError, Result};
pub use merkle::{compute_root, verify_proof, MerkleProof, MerkleTree, Position, ProofStep};
#[cfg(feature = "sqlite")]
pub use receipt_store::{ReceiptStatus, ReceiptStore, StoredReceipt};
pub use types::{AnchorReceipt, Batch, BatchItem, EntityRef, EventCategory};
