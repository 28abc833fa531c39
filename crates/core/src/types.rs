//! Core types

use crate::digest::Digest;
use crate::error::CoreError;
use crate::merkle::MerkleProof;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Clinical event category. Each category batches independently and anchors to its
/// own ledger topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    MedicalRecord,
    Prescription,
    Delivery,
    AccessControl,
}

impl EventCategory {
    pub const ALL: [EventCategory; 4] = [
        EventCategory::MedicalRecord,
        EventCategory::Prescription,
        EventCategory::Delivery,
        EventCategory::AccessControl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::MedicalRecord => "medical_record",
            EventCategory::Prescription => "prescription",
            EventCategory::Delivery => "delivery",
            EventCategory::AccessControl => "access_control",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CoreError::InvalidConfig(format!("unknown event category: {}", s)))
    }
}

/// Reference to the domain record an anchor belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// One event inside a flushed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub category: EventCategory,
    pub payload_ref: EntityRef,
    pub digest: Digest,
    /// Arrival index within the batch; also the leaf index
    pub index: usize,
    pub proof: MerkleProof,
}

/// A flushed batch, ready to anchor as a single Merkle root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: Uuid,
    pub merkle_root: Digest,
    pub height: usize,
    pub items: Vec<BatchItem>,
    pub created_at: DateTime<Utc>,
    pub category: EventCategory,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Leaf digests in arrival order
    pub fn leaves(&self) -> Vec<Digest> {
        self.items.iter().map(|item| item.digest.clone()).collect()
    }
}

/// Durable result of a successful anchor, handed to the persistence layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorReceipt {
    pub ledger_transaction_id: String,
    pub topic_id: String,
    pub sequence_number: u64,
    pub consensus_timestamp: DateTime<Utc>,
    pub compressed: bool,
    /// Bytes submitted to the ledger
    pub message_size: usize,
    pub compression_ratio: f64,
    pub response_time_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<MerkleProof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
}

impl AnchorReceipt {
    pub fn is_batched(&self) -> bool {
        self.merkle_root.is_some()
    }

    /// Per-item receipt derived from a batch-level receipt
    pub fn for_batch_item(&self, batch: &Batch, item: &BatchItem) -> Self {
        Self {
            merkle_root: Some(batch.merkle_root.clone()),
            proof: Some(item.proof.clone()),
            batch_id: Some(batch.batch_id),
            ..self.clone()
        }
    }
}
