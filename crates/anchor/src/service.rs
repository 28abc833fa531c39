//! Anchoring service
//!
//! Wires the aggregator, rate limiter, retry queue, ledger client and receipt store
//! into the two entry points used by domain code:
//! - `anchor_direct` submits a single event digest right away
//! - `anchor_batched` adds the event to its category's pending batch
//!
//! Persisting receipts is the last step of every successful anchor. Entities that
//! exhaust their retries are marked `anchoring_failed`.

use crate::aggregator::{AggregatorStats, BatchAggregator, ItemTicket};
use crate::error::{AnchorError, Result};
use crate::ledger::LedgerClient;
use crate::limiter::{LimiterStats, RateLimiter};
use crate::message::AnchorMessage;
use crate::queue::{AnchoringQueue, Completion, QueueStats};
use crate::submit::LedgerSubmitter;
use crate::verify::VerificationService;
use carechain_core::{
    digest, AnchorConfig, AnchorReceipt, Batch, CompressionCodec, Digest, EntityRef,
    EventCategory, ReceiptStore,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of a direct anchor request
#[derive(Debug, Clone, PartialEq)]
pub enum AnchorOutcome {
    Anchored(AnchorReceipt),
    /// First attempt hit a transient ledger error; the queue owns it now
    Queued { entry_id: Uuid, digest: Digest },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub direct_anchored: u64,
    pub direct_queued: u64,
    pub batches_received: u64,
    pub limiter: LimiterStats,
    pub queue: QueueStats,
    pub aggregator: AggregatorStats,
}

#[derive(Default)]
struct Counters {
    direct_anchored: AtomicU64,
    direct_queued: AtomicU64,
    batches_received: AtomicU64,
}

pub struct AnchorService {
    aggregator: BatchAggregator,
    limiter: RateLimiter,
    queue: AnchoringQueue,
    submitter: Arc<LedgerSubmitter>,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<ReceiptStore>,
    counters: Arc<Counters>,
    shutting_down: AtomicBool,
    batch_task: Mutex<Option<JoinHandle<()>>>,
}

impl AnchorService {
    /// Build the service. Must be called inside a tokio runtime.
    pub fn new(
        config: AnchorConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<ReceiptStore>,
    ) -> Result<Self> {
        config.validate()?;

        let limiter = RateLimiter::new(config.rate_limit.clone());
        let codec = CompressionCodec::new(&config.compression);
        let submitter = Arc::new(LedgerSubmitter::new(
            codec,
            limiter.clone(),
            Arc::clone(&ledger),
        ));
        let queue = AnchoringQueue::new(config.queue.clone(), submitter.clone());

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let aggregator = BatchAggregator::new(config.batch.clone(), batch_tx);
        let counters = Arc::new(Counters::default());

        let batch_task = tokio::spawn(consume_batches(
            batch_rx,
            queue.clone(),
            Arc::clone(&store),
            Arc::clone(&counters),
        ));

        info!(
            max_batch_size = config.batch.max_batch_size,
            batch_timeout_ms = config.batch.batch_timeout_ms,
            max_ops_per_second = config.rate_limit.max_ops_per_second,
            max_attempts = config.queue.max_attempts,
            "Anchor service started"
        );

        Ok(Self {
            aggregator,
            limiter,
            queue,
            submitter,
            ledger,
            store,
            counters,
            shutting_down: AtomicBool::new(false),
            batch_task: Mutex::new(Some(batch_task)),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(AnchorError::Shutdown);
        }
        Ok(())
    }

    /// Anchor one event immediately.
    ///
    /// A transient ledger failure hands the event to the retry queue and returns
    /// [`AnchorOutcome::Queued`]. Any other failure marks the entity failed.
    pub async fn anchor_direct<T: Serialize + ?Sized>(
        &self,
        category: EventCategory,
        entity: EntityRef,
        payload: &T,
    ) -> Result<AnchorOutcome> {
        self.ensure_running()?;
        let digest = digest(payload)?;
        let message = AnchorMessage::for_event(category, &entity, digest.clone());

        match self.submitter.submit_message(&message).await {
            Ok(receipt) => {
                self.store.record_receipt(&entity, category, &digest, &receipt)?;
                self.counters.direct_anchored.fetch_add(1, Ordering::Relaxed);
                Ok(AnchorOutcome::Anchored(receipt))
            }
            Err(e) if e.is_retryable() => {
                warn!(entity = %entity, error = %e, "Direct anchor failed, queued for retry");
                let completion = direct_completion(Arc::clone(&self.store), entity, category, digest.clone());
                let entry_id = self.queue.enqueue(message, completion);
                self.counters.direct_queued.fetch_add(1, Ordering::Relaxed);
                Ok(AnchorOutcome::Queued { entry_id, digest })
            }
            Err(e) => {
                if let Err(store_err) =
                    self.store.mark_failed(&entity, category, &digest, &e.to_string())
                {
                    error!(entity = %entity, error = %store_err, "Failed to record anchoring failure");
                }
                Err(e)
            }
        }
    }

    /// Add one event to its category's pending batch
    pub async fn anchor_batched<T: Serialize + ?Sized>(
        &self,
        category: EventCategory,
        entity: EntityRef,
        payload: &T,
    ) -> Result<ItemTicket> {
        self.ensure_running()?;
        self.aggregator.add_item(category, entity, payload).await
    }

    /// Flush every pending batch, then wait up to `drain_timeout` for the queue.
    ///
    /// Entries still queued when the timeout expires are abandoned.
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!(pending = self.aggregator.total_pending(), "Anchor service shutting down");

        let flushed = self.aggregator.flush_all().await;

        let drained = tokio::time::timeout(drain_timeout, self.drained()).await;
        if drained.is_err() {
            warn!(
                remaining = self.queue.len(),
                "Shutdown drain timed out, queued anchors abandoned"
            );
        }

        if let Some(task) = self.batch_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }

        flushed.map(|batches| {
            info!(batches = batches.len(), "Anchor service stopped");
        })
    }

    /// Wait until every emitted batch has been handed to the queue and the queue is empty
    pub async fn drained(&self) {
        loop {
            let emitted = self.aggregator.stats().batches_emitted;
            let received = self.counters.batches_received.load(Ordering::SeqCst);
            if emitted == received && self.queue.is_empty() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn verifier(&self) -> VerificationService {
        VerificationService::new(Arc::clone(&self.ledger), self.submitter.codec().clone())
    }

    pub fn aggregator(&self) -> &BatchAggregator {
        &self.aggregator
    }

    pub fn queue(&self) -> &AnchoringQueue {
        &self.queue
    }

    pub fn store(&self) -> &ReceiptStore {
        &self.store
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            direct_anchored: self.counters.direct_anchored.load(Ordering::Relaxed),
            direct_queued: self.counters.direct_queued.load(Ordering::Relaxed),
            batches_received: self.counters.batches_received.load(Ordering::Relaxed),
            limiter: self.limiter.stats(),
            queue: self.queue.stats(),
            aggregator: self.aggregator.stats(),
        }
    }
}

impl Drop for AnchorService {
    fn drop(&mut self) {
        if let Some(task) = self.batch_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

/// Completion for an event that fell back to the queue after its first attempt
fn direct_completion(
    store: Arc<ReceiptStore>,
    entity: EntityRef,
    category: EventCategory,
    digest: Digest,
) -> Completion {
    let failed_store = Arc::clone(&store);
    let failed_entity = entity.clone();
    let failed_digest = digest.clone();

    Completion::new(
        move |mut receipt: AnchorReceipt| {
            // Count the direct attempt that preceded the queue
            receipt.attempts += 1;
            if let Err(e) = store.record_receipt(&entity, category, &digest, &receipt) {
                error!(entity = %entity, error = %e, "Failed to record receipt");
            }
        },
        move |err: AnchorError| {
            if let Err(e) =
                failed_store.mark_failed(&failed_entity, category, &failed_digest, &err.to_string())
            {
                error!(entity = %failed_entity, error = %e, "Failed to record anchoring failure");
            }
        },
    )
}

/// Completion fanning a batch-level outcome out to every item
fn batch_completion(store: Arc<ReceiptStore>, batch: Batch) -> Completion {
    let batch = Arc::new(batch);
    let failed_batch = Arc::clone(&batch);
    let failed_store = Arc::clone(&store);

    Completion::new(
        move |receipt: AnchorReceipt| {
            for item in &batch.items {
                let item_receipt = receipt.for_batch_item(&batch, item);
                if let Err(e) =
                    store.record_receipt(&item.payload_ref, batch.category, &item.digest, &item_receipt)
                {
                    error!(entity = %item.payload_ref, error = %e, "Failed to record receipt");
                }
            }
            info!(
                batch_id = %batch.batch_id,
                item_count = batch.len(),
                transaction_id = %receipt.ledger_transaction_id,
                "Batch receipts recorded"
            );
        },
        move |err: AnchorError| {
            let reason = err.to_string();
            for item in &failed_batch.items {
                if let Err(e) = failed_store.mark_failed(
                    &item.payload_ref,
                    failed_batch.category,
                    &item.digest,
                    &reason,
                ) {
                    error!(entity = %item.payload_ref, error = %e, "Failed to record anchoring failure");
                }
            }
        },
    )
}

async fn consume_batches(
    mut batch_rx: mpsc::UnboundedReceiver<Batch>,
    queue: AnchoringQueue,
    store: Arc<ReceiptStore>,
    counters: Arc<Counters>,
) {
    while let Some(batch) = batch_rx.recv().await {
        let message = AnchorMessage::for_batch(&batch);
        let batch_id = batch.batch_id;
        let entry_id = queue.enqueue(message, batch_completion(Arc::clone(&store), batch));
        counters.batches_received.fetch_add(1, Ordering::SeqCst);
        info!(batch_id = %batch_id, entry_id = %entry_id, "Batch handed to anchoring queue");
    }
}
