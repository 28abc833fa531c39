//! Anchor verification.
//!
//! Recomputes a record's digest, checks any Merkle proof locally, then reads the
//! transaction and the topic message back from the ledger and compares the committed
//! digest. Verification never returns an error: every failure mode is a status.

use crate::ledger::{LedgerClient, LedgerError, TransactionStatus};
use crate::message::committed_digest;
use carechain_core::{
    digest, verify_proof, AnchorReceipt, CompressionCodec, Digest, EntityRef, ReceiptStatus,
    ReceiptStore,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Local digest, proof and ledger contents all agree
    FullyVerified,
    /// Local checks passed but the ledger could not be consulted
    LocallyVerifiedOnly,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub entity: EntityRef,
    pub status: VerificationStatus,
    pub recomputed_digest: Option<Digest>,
    pub stored_digest: Option<Digest>,
    pub local_digest_matches: bool,
    /// `None` for direct anchors
    pub proof_valid: Option<bool>,
    pub ledger_status: Option<TransactionStatus>,
    pub ledger_digest_matches: Option<bool>,
    pub consensus_timestamp: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl VerificationReport {
    fn new(entity: &EntityRef) -> Self {
        Self {
            entity: entity.clone(),
            status: VerificationStatus::Failed,
            recomputed_digest: None,
            stored_digest: None,
            local_digest_matches: false,
            proof_valid: None,
            ledger_status: None,
            ledger_digest_matches: None,
            consensus_timestamp: None,
            reason: None,
            checked_at: Utc::now(),
        }
    }

    fn failed(mut self, reason: impl Into<String>) -> Self {
        self.status = VerificationStatus::Failed;
        self.reason = Some(reason.into());
        self
    }

    fn local_only(mut self, reason: impl Into<String>) -> Self {
        self.status = VerificationStatus::LocallyVerifiedOnly;
        self.reason = Some(reason.into());
        self
    }

    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::FullyVerified
    }
}

pub struct VerificationService {
    ledger: Arc<dyn LedgerClient>,
    codec: CompressionCodec,
    read_timeout: Duration,
}

impl VerificationService {
    pub fn new(ledger: Arc<dyn LedgerClient>, codec: CompressionCodec) -> Self {
        Self {
            ledger,
            codec,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Verify a record against the row persisted for it
    pub async fn verify_stored<T: Serialize + ?Sized>(
        &self,
        store: &ReceiptStore,
        entity: &EntityRef,
        payload: &T,
    ) -> VerificationReport {
        let report = VerificationReport::new(entity);
        let row = match store.get(entity) {
            Ok(Some(row)) => row,
            Ok(None) => return report.failed("no anchor recorded for entity"),
            Err(e) => return report.failed(format!("receipt store read failed: {}", e)),
        };

        match (row.status, row.receipt) {
            (ReceiptStatus::Anchored, Some(receipt)) => {
                self.verify(entity, payload, &row.digest, &receipt).await
            }
            (ReceiptStatus::AnchoringFailed, _) => {
                let reason = row
                    .last_error
                    .map(|e| format!("anchoring failed: {}", e))
                    .unwrap_or_else(|| "anchoring failed".to_string());
                VerificationReport {
                    stored_digest: Some(row.digest),
                    ..report.failed(reason)
                }
            }
            (ReceiptStatus::Anchored, None) => report.failed("anchored row has no receipt"),
        }
    }

    /// Verify `payload` against its stored digest and anchor receipt
    pub async fn verify<T: Serialize + ?Sized>(
        &self,
        entity: &EntityRef,
        payload: &T,
        stored_digest: &Digest,
        receipt: &AnchorReceipt,
    ) -> VerificationReport {
        let mut report = VerificationReport::new(entity);
        report.stored_digest = Some(stored_digest.clone());

        let recomputed = match digest(payload) {
            Ok(d) => d,
            Err(e) => return report.failed(format!("payload could not be hashed: {}", e)),
        };
        report.local_digest_matches = &recomputed == stored_digest;
        report.recomputed_digest = Some(recomputed);
        if !report.local_digest_matches {
            return report.failed("payload digest does not match stored digest");
        }

        // What the ledger message must commit to
        let expected = match (&receipt.merkle_root, &receipt.proof) {
            (Some(root), Some(proof)) => {
                let valid = verify_proof(stored_digest, proof, root);
                report.proof_valid = Some(valid);
                if !valid {
                    return report.failed("Merkle proof does not lead to the anchored root");
                }
                root.clone()
            }
            (Some(_), None) => return report.failed("batched receipt is missing its proof"),
            (None, _) => stored_digest.clone(),
        };

        let tx = match timeout(
            self.read_timeout,
            self.ledger.read_transaction(&receipt.ledger_transaction_id),
        )
        .await
        {
            Ok(Ok(tx)) => tx,
            Ok(Err(e)) if !e.is_transient() => {
                return report.failed(format!("transaction lookup failed: {}", e))
            }
            Ok(Err(e)) => return self.degrade(report, e.to_string()),
            Err(_) => return self.degrade(report, "transaction lookup timed out".to_string()),
        };
        report.consensus_timestamp = tx.consensus_timestamp;
        report.ledger_status = Some(tx.status.clone());
        if tx.status != TransactionStatus::Success {
            return report.failed(format!("ledger transaction status is {:?}", tx.status));
        }

        let message = match timeout(
            self.read_timeout,
            self.ledger
                .read_topic_message(&receipt.topic_id, receipt.sequence_number),
        )
        .await
        {
            Ok(Ok(message)) => message,
            Ok(Err(LedgerError::NotFound(what))) => {
                return report.failed(format!("ledger message not found: {}", what))
            }
            Ok(Err(e)) if !e.is_transient() => {
                return report.failed(format!("message lookup failed: {}", e))
            }
            Ok(Err(e)) => return self.degrade(report, e.to_string()),
            Err(_) => return self.degrade(report, "message lookup timed out".to_string()),
        };

        let decoded = match self.codec.decode_base64_message(&message.message) {
            Ok(decoded) => decoded,
            Err(e) => return report.failed(format!("ledger message undecodable: {}", e)),
        };

        let matches = committed_digest(&decoded.payload).as_ref() == Some(&expected);
        report.ledger_digest_matches = Some(matches);
        if !matches {
            warn!(
                entity = %entity,
                transaction_id = %receipt.ledger_transaction_id,
                "Ledger message does not commit to the expected digest"
            );
            return report.failed("ledger message does not commit to the expected digest");
        }

        debug!(entity = %entity, batched = receipt.is_batched(), "Anchor fully verified");
        report.status = VerificationStatus::FullyVerified;
        report
    }

    fn degrade(&self, report: VerificationReport, reason: String) -> VerificationReport {
        warn!(entity = %report.entity, reason = %reason, "Ledger unreachable during verification");
        report.local_only(format!("ledger unreachable: {}", reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryLedger, SubmitReceipt, TopicMessage, TransactionRecord};
    use crate::limiter::RateLimiter;
    use crate::message::AnchorMessage;
    use crate::submit::LedgerSubmitter;
    use async_trait::async_trait;
    use carechain_core::{CompressionConfig, EventCategory, RateLimitConfig};
    use serde_json::json;

    /// Reads that can be made to hang or to fail permanently
    struct FlakyReads {
        inner: Arc<MemoryLedger>,
        hang_transactions: bool,
        hang_messages: bool,
        reject_messages: bool,
    }

    impl FlakyReads {
        fn new(inner: Arc<MemoryLedger>) -> Self {
            Self {
                inner,
                hang_transactions: false,
                hang_messages: false,
                reject_messages: false,
            }
        }
    }

    #[async_trait]
    impl LedgerClient for FlakyReads {
        async fn submit(
            &self,
            message: Vec<u8>,
            category: EventCategory,
        ) -> std::result::Result<SubmitReceipt, LedgerError> {
            self.inner.submit(message, category).await
        }

        async fn read_transaction(
            &self,
            transaction_id: &str,
        ) -> std::result::Result<TransactionRecord, LedgerError> {
            if self.hang_transactions {
                std::future::pending::<()>().await;
            }
            self.inner.read_transaction(transaction_id).await
        }

        async fn read_topic_message(
            &self,
            topic_id: &str,
            sequence_number: u64,
        ) -> std::result::Result<TopicMessage, LedgerError> {
            if self.hang_messages {
                std::future::pending::<()>().await;
            }
            if self.reject_messages {
                return Err(LedgerError::Rejected("topic deleted".to_string()));
            }
            self.inner.read_topic_message(topic_id, sequence_number).await
        }
    }

    fn codec() -> CompressionCodec {
        CompressionCodec::new(&CompressionConfig::default())
    }

    /// Anchor one event directly and return its digest and receipt
    async fn anchor(ledger: Arc<MemoryLedger>, payload: &serde_json::Value) -> (Digest, AnchorReceipt) {
        let entity = EntityRef::new("prescription", "rx-1");
        let stored = digest(payload).unwrap();
        let submitter = LedgerSubmitter::new(codec(), RateLimiter::new(RateLimitConfig::default()), ledger);
        let message = AnchorMessage::for_event(EventCategory::Prescription, &entity, stored.clone());
        let receipt = submitter.submit_message(&message).await.unwrap();
        (stored, receipt)
    }

    fn entity() -> EntityRef {
        EntityRef::new("prescription", "rx-1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_anchor_fully_verified() {
        let ledger = Arc::new(MemoryLedger::new());
        let payload = json!({ "medication": "amoxicillin", "dosageMg": 500 });
        let (stored, receipt) = anchor(Arc::clone(&ledger), &payload).await;

        let verifier = VerificationService::new(ledger, codec());
        let report = verifier.verify(&entity(), &payload, &stored, &receipt).await;

        assert!(report.is_verified(), "{:?}", report.reason);
        assert_eq!(report.ledger_status, Some(TransactionStatus::Success));
        assert_eq!(report.ledger_digest_matches, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsuccessful_transaction_fails() {
        for status in [TransactionStatus::Pending, TransactionStatus::Failed] {
            let ledger = Arc::new(MemoryLedger::new());
            let payload = json!({ "medication": "ibuprofen" });
            let (stored, receipt) = anchor(Arc::clone(&ledger), &payload).await;
            assert!(ledger.set_transaction_status(&receipt.ledger_transaction_id, status.clone()));

            let verifier = VerificationService::new(ledger, codec());
            let report = verifier.verify(&entity(), &payload, &stored, &receipt).await;

            assert_eq!(report.status, VerificationStatus::Failed);
            assert!(report.local_digest_matches);
            assert_eq!(report.ledger_status, Some(status));
            assert!(report.reason.unwrap().contains("transaction status"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_transaction_read_degrades() {
        let ledger = Arc::new(MemoryLedger::new());
        let payload = json!({ "medication": "metformin" });
        let (stored, receipt) = anchor(Arc::clone(&ledger), &payload).await;

        let mut reads = FlakyReads::new(ledger);
        reads.hang_transactions = true;
        let verifier = VerificationService::new(Arc::new(reads), codec())
            .with_read_timeout(Duration::from_millis(200));

        let started = tokio::time::Instant::now();
        let report = verifier.verify(&entity(), &payload, &stored, &receipt).await;

        assert_eq!(report.status, VerificationStatus::LocallyVerifiedOnly);
        assert!(report.local_digest_matches);
        assert!(report.reason.unwrap().contains("timed out"));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < DEFAULT_READ_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_message_read_degrades() {
        let ledger = Arc::new(MemoryLedger::new());
        let payload = json!({ "medication": "lisinopril" });
        let (stored, receipt) = anchor(Arc::clone(&ledger), &payload).await;

        let mut reads = FlakyReads::new(ledger);
        reads.hang_messages = true;
        let verifier = VerificationService::new(Arc::new(reads), codec())
            .with_read_timeout(Duration::from_millis(200));
        let report = verifier.verify(&entity(), &payload, &stored, &receipt).await;

        assert_eq!(report.status, VerificationStatus::LocallyVerifiedOnly);
        assert_eq!(report.ledger_status, Some(TransactionStatus::Success));
        assert!(report.reason.unwrap().contains("message lookup timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_message_read_fails() {
        let ledger = Arc::new(MemoryLedger::new());
        let payload = json!({ "medication": "atorvastatin" });
        let (stored, receipt) = anchor(Arc::clone(&ledger), &payload).await;

        let mut reads = FlakyReads::new(ledger);
        reads.reject_messages = true;
        let verifier = VerificationService::new(Arc::new(reads), codec());
        let report = verifier.verify(&entity(), &payload, &stored, &receipt).await;

        assert_eq!(report.status, VerificationStatus::Failed);
        let reason = report.reason.unwrap();
        assert!(reason.contains("message lookup failed"), "{}", reason);
        assert!(!reason.contains("unreachable"));
    }
}
