//! Ledger client boundary.
//!
//! [`LedgerClient`] is the contract with the external append-only ledger service.
//! [`MemoryLedger`] is an in-process implementation with the same append-only
//! guarantees (per-topic sequence numbers start at 1 and increase by 1, messages are
//! never rewritten by normal operation) plus fault injection for tests and local runs.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use carechain_core::EventCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

/// Errors reported by the ledger collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Ledger busy: {0}")]
    Busy(String),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Submission rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl LedgerError {
    /// Busy and unavailable are worth retrying; the rest are final
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Busy(_) | LedgerError::Unavailable(_))
    }
}

/// Result of a successful submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub transaction_id: String,
    pub topic_id: String,
    pub sequence_number: u64,
    pub consensus_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Success,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub status: TransactionStatus,
    pub consensus_timestamp: Option<DateTime<Utc>>,
}

/// A topic message as read back from the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicMessage {
    /// Base64 of the submitted bytes
    pub message: String,
    pub consensus_timestamp: DateTime<Utc>,
}

/// Contract with the external ledger service
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Append a message to the topic selected by `category`
    async fn submit(
        &self,
        message: Vec<u8>,
        category: EventCategory,
    ) -> Result<SubmitReceipt, LedgerError>;

    async fn read_transaction(&self, transaction_id: &str)
        -> Result<TransactionRecord, LedgerError>;

    async fn read_topic_message(
        &self,
        topic_id: &str,
        sequence_number: u64,
    ) -> Result<TopicMessage, LedgerError>;
}

struct TopicLog {
    topic_id: String,
    messages: Vec<(Vec<u8>, DateTime<Utc>)>,
}

#[derive(Default)]
struct MemoryLedgerState {
    topics: HashMap<EventCategory, TopicLog>,
    transactions: HashMap<String, TransactionRecord>,
    fail_next: u32,
    offline: bool,
    submissions: u64,
    rejected_attempts: u64,
}

/// In-process append-only ledger
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryLedgerState>,
}

impl MemoryLedger {
    /// Account used in transaction ids
    const OPERATOR_ACCOUNT: &'static str = "0.0.1001";

    /// First topic number; categories map to consecutive topics
    const TOPIC_BASE: u64 = 5001;

    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryLedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Topic id assigned to a category
    pub fn topic_id(category: EventCategory) -> String {
        let offset = EventCategory::ALL
            .iter()
            .position(|c| *c == category)
            .unwrap_or_default() as u64;
        format!("0.0.{}", Self::TOPIC_BASE + offset)
    }

    /// Make the next `n` submissions fail with `Busy`
    pub fn fail_next_submissions(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// While offline every call fails with `Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Successful submissions so far
    pub fn submission_count(&self) -> u64 {
        self.state().submissions
    }

    /// Submissions refused by injected faults
    pub fn failed_submission_count(&self) -> u64 {
        self.state().rejected_attempts
    }

    /// Raw messages of a category's topic, in sequence order
    pub fn messages(&self, category: EventCategory) -> Vec<Vec<u8>> {
        self.state()
            .topics
            .get(&category)
            .map(|log| log.messages.iter().map(|(m, _)| m.clone()).collect())
            .unwrap_or_default()
    }

    /// Overwrite a stored message. Only meaningful for tamper tests.
    pub fn overwrite_message(&self, category: EventCategory, sequence_number: u64, message: Vec<u8>) -> bool {
        let mut state = self.state();
        let Some(log) = state.topics.get_mut(&category) else {
            return false;
        };
        match log.messages.get_mut(sequence_number.saturating_sub(1) as usize) {
            Some(slot) => {
                slot.0 = message;
                true
            }
            None => false,
        }
    }

    /// Force a transaction status, e.g. to simulate a failed consensus outcome
    pub fn set_transaction_status(&self, transaction_id: &str, status: TransactionStatus) -> bool {
        match self.state().transactions.get_mut(transaction_id) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn submit(
        &self,
        message: Vec<u8>,
        category: EventCategory,
    ) -> Result<SubmitReceipt, LedgerError> {
        let mut state = self.state();

        if state.offline {
            state.rejected_attempts += 1;
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            state.rejected_attempts += 1;
            return Err(LedgerError::Busy("too many requests".to_string()));
        }
        if message.is_empty() {
            return Err(LedgerError::Rejected("empty message".to_string()));
        }

        let now = Utc::now();
        let log = state.topics.entry(category).or_insert_with(|| TopicLog {
            topic_id: Self::topic_id(category),
            messages: Vec::new(),
        });
        log.messages.push((message, now));
        let sequence_number = log.messages.len() as u64;
        let topic_id = log.topic_id.clone();

        state.submissions += 1;
        let transaction_id = format!(
            "{}@{}.{:09}",
            Self::OPERATOR_ACCOUNT,
            now.timestamp(),
            state.submissions
        );
        state.transactions.insert(
            transaction_id.clone(),
            TransactionRecord {
                status: TransactionStatus::Success,
                consensus_timestamp: Some(now),
            },
        );

        debug!(
            topic_id = %topic_id,
            sequence_number,
            transaction_id = %transaction_id,
            "Message appended to ledger"
        );

        Ok(SubmitReceipt {
            transaction_id,
            topic_id,
            sequence_number,
            consensus_timestamp: now,
        })
    }

    async fn read_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<TransactionRecord, LedgerError> {
        let state = self.state();
        if state.offline {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        state
            .transactions
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", transaction_id)))
    }

    async fn read_topic_message(
        &self,
        topic_id: &str,
        sequence_number: u64,
    ) -> Result<TopicMessage, LedgerError> {
        let state = self.state();
        if state.offline {
            return Err(LedgerError::Unavailable("ledger offline".to_string()));
        }
        state
            .topics
            .values()
            .find(|log| log.topic_id == topic_id)
            .and_then(|log| log.messages.get(sequence_number.checked_sub(1)? as usize))
            .map(|(bytes, ts)| TopicMessage {
                message: BASE64.encode(bytes),
                consensus_timestamp: *ts,
            })
            .ok_or_else(|| {
                LedgerError::NotFound(format!("message {}#{}", topic_id, sequence_number))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_numbers_per_topic() {
        let ledger = MemoryLedger::new();
        let a = ledger.submit(b"a".to_vec(), EventCategory::Prescription).await.unwrap();
        let b = ledger.submit(b"b".to_vec(), EventCategory::Prescription).await.unwrap();
        let c = ledger.submit(b"c".to_vec(), EventCategory::Delivery).await.unwrap();

        assert_eq!((a.sequence_number, b.sequence_number, c.sequence_number), (1, 2, 1));
        assert_eq!(a.topic_id, b.topic_id);
        assert_ne!(a.topic_id, c.topic_id);
        assert_ne!(a.transaction_id, b.transaction_id);
    }

    #[tokio::test]
    async fn test_read_back() {
        let ledger = MemoryLedger::new();
        let r = ledger.submit(b"hello".to_vec(), EventCategory::MedicalRecord).await.unwrap();

        let tx = ledger.read_transaction(&r.transaction_id).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Success);

        let msg = ledger.read_topic_message(&r.topic_id, r.sequence_number).await.unwrap();
        assert_eq!(BASE64.decode(msg.message).unwrap(), b"hello");

        assert!(matches!(
            ledger.read_topic_message(&r.topic_id, 0).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let ledger = MemoryLedger::new();
        ledger.fail_next_submissions(2);

        for _ in 0..2 {
            let err = ledger.submit(b"x".to_vec(), EventCategory::Delivery).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(ledger.submit(b"x".to_vec(), EventCategory::Delivery).await.is_ok());
        assert_eq!(ledger.failed_submission_count(), 2);

        ledger.set_offline(true);
        assert!(matches!(
            ledger.read_transaction("anything").await,
            Err(LedgerError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_is_not_transient() {
        let ledger = MemoryLedger::new();
        let err = ledger.submit(Vec::new(), EventCategory::Delivery).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
