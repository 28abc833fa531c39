//! Anchor message body
//!
//! The JSON document wrapped by the wire envelope. A direct anchor carries the event
//! digest; a batch anchor carries the Merkle root. Nothing clinical is ever written.

use carechain_core::digest::iso8601;
use carechain_core::{Batch, Digest, EntityRef, EventCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Event,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorMessage {
    pub kind: MessageKind,
    pub category: EventCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub item_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(with = "iso8601")]
    pub anchored_at: DateTime<Utc>,
}

impl AnchorMessage {
    pub fn for_event(category: EventCategory, entity: &EntityRef, digest: Digest) -> Self {
        Self {
            kind: MessageKind::Event,
            category,
            digest: Some(digest),
            merkle_root: None,
            batch_id: None,
            item_count: 1,
            entity_type: Some(entity.entity_type.clone()),
            entity_id: Some(entity.entity_id.clone()),
            anchored_at: Utc::now(),
        }
    }

    pub fn for_batch(batch: &Batch) -> Self {
        Self {
            kind: MessageKind::Batch,
            category: batch.category,
            digest: None,
            merkle_root: Some(batch.merkle_root.clone()),
            batch_id: Some(batch.batch_id),
            item_count: batch.len(),
            entity_type: None,
            entity_id: None,
            anchored_at: Utc::now(),
        }
    }

    /// Digest this message commits to: the event digest or the batch root
    pub fn anchored_digest(&self) -> Option<&Digest> {
        match self.kind {
            MessageKind::Event => self.digest.as_ref(),
            MessageKind::Batch => self.merkle_root.as_ref(),
        }
    }

    pub fn to_json(&self) -> carechain_core::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Digest committed to by a decoded ledger payload.
///
/// Current messages parse as [`AnchorMessage`]. Legacy payloads are loose JSON objects
/// carrying one of `digest`, `hash`, `merkleRoot` or `merkle_root`.
pub fn committed_digest(payload: &str) -> Option<Digest> {
    if let Ok(message) = serde_json::from_str::<AnchorMessage>(payload) {
        return message.anchored_digest().cloned();
    }

    let value: Value = serde_json::from_str(payload).ok()?;
    ["digest", "hash", "merkleRoot", "merkle_root"]
        .iter()
        .filter_map(|key| value.get(*key)?.as_str())
        .find_map(|s| Digest::from_hex(s).ok())
}
