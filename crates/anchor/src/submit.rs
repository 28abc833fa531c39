//! Single submission attempt: encode, compress, rate limit, submit.

use crate::error::Result;
use crate::ledger::LedgerClient;
use crate::limiter::RateLimiter;
use crate::message::AnchorMessage;
use crate::queue::Submitter;
use async_trait::async_trait;
use carechain_core::{AnchorReceipt, CompressionCodec};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

pub struct LedgerSubmitter {
    codec: CompressionCodec,
    limiter: RateLimiter,
    ledger: Arc<dyn LedgerClient>,
}

impl LedgerSubmitter {
    pub fn new(codec: CompressionCodec, limiter: RateLimiter, ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            codec,
            limiter,
            ledger,
        }
    }

    pub fn codec(&self) -> &CompressionCodec {
        &self.codec
    }

    /// One attempt. The receipt reports `attempts = 1`; retry drivers overwrite it.
    pub async fn submit_message(&self, message: &AnchorMessage) -> Result<AnchorReceipt> {
        let payload = message.to_json()?;
        let envelope = self.codec.compress(&payload);
        let bytes = envelope.to_bytes()?;
        let message_size = bytes.len();

        let waited = self.limiter.acquire().await;

        let started = Instant::now();
        let submitted = self.ledger.submit(bytes, message.category).await?;
        let response_time_ms = started.elapsed().as_millis() as u64;

        debug!(
            category = %message.category,
            kind = ?message.kind,
            transaction_id = %submitted.transaction_id,
            sequence_number = submitted.sequence_number,
            compressed = envelope.c,
            message_size,
            throttled_ms = waited.as_millis() as u64,
            response_time_ms,
            "Message anchored"
        );

        Ok(AnchorReceipt {
            ledger_transaction_id: submitted.transaction_id,
            topic_id: submitted.topic_id,
            sequence_number: submitted.sequence_number,
            consensus_timestamp: submitted.consensus_timestamp,
            compressed: envelope.c,
            message_size,
            compression_ratio: envelope.meta.ratio,
            response_time_ms,
            attempts: 1,
            merkle_root: message.merkle_root.clone(),
            proof: None,
            batch_id: message.batch_id,
        })
    }
}

#[async_trait]
impl Submitter for LedgerSubmitter {
    async fn submit(&self, message: &AnchorMessage) -> Result<AnchorReceipt> {
        self.submit_message(message).await
    }
}
