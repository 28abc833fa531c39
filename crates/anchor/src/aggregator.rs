//! Batch aggregation
//!
//! Collects event digests per category and flushes them as a Merkle-rooted [`Batch`]
//! when either threshold is reached:
//! - Count: `max_batch_size` pending items flush immediately
//! - Time: `batch_timeout` after the first pending item. A category still below
//!   `min_batch_size` at that point gets exactly one grace period, then flushes
//!   whatever it has.
//!
//! Flushed batches are emitted on an unbounded channel to the anchoring path.
//! Pending items are held in memory only and do not survive a restart.

use crate::error::{AnchorError, Result};
use carechain_core::{digest, Batch, BatchConfig, BatchItem, Digest, EntityRef, EventCategory, MerkleTree};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Receipt for an item accepted into a pending batch
#[derive(Debug, Clone, PartialEq)]
pub struct ItemTicket {
    pub category: EventCategory,
    pub digest: Digest,
    /// Position in the pending batch, which becomes the leaf index
    pub index: usize,
    /// Set when this item completed a batch and triggered a flush
    pub flushed_batch: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorStats {
    pub items_added: u64,
    pub batches_emitted: u64,
    pub items_batched: u64,
    pub size_flushes: u64,
    pub timed_flushes: u64,
    pub grace_extensions: u64,
    pub flush_failures: u64,
}

#[derive(Debug, Clone)]
struct PendingItem {
    payload_ref: EntityRef,
    digest: Digest,
}

#[derive(Default)]
struct CategoryState {
    /// Items in arrival order
    pending: Vec<PendingItem>,
    /// Bumped on every flush; a timer only acts on the epoch it was armed for
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct AggregatorState {
    categories: HashMap<EventCategory, CategoryState>,
    stats: AggregatorStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Timer(u64),
    Manual,
}

struct Inner {
    /// Configuration
    config: BatchConfig,
    /// Pending items and timers per category
    state: Mutex<AggregatorState>,
    /// Anchoring path
    batch_tx: mpsc::UnboundedSender<Batch>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm_timer(self: &Arc<Self>, category: EventCategory, slot: &mut CategoryState) {
        let epoch = slot.epoch;
        let inner = Arc::clone(self);
        slot.timer = Some(tokio::spawn(async move {
            inner.run_timer(category, epoch).await;
        }));
    }

    async fn run_timer(self: Arc<Self>, category: EventCategory, epoch: u64) {
        let timeout = self.config.batch_timeout();
        sleep(timeout).await;

        let needs_grace = {
            let mut state = self.state();
            let pending = match state.categories.get(&category) {
                Some(slot) if slot.epoch == epoch && !slot.pending.is_empty() => slot.pending.len(),
                _ => return,
            };
            let short = pending < self.config.min_batch_size;
            if short {
                state.stats.grace_extensions += 1;
                debug!(
                    category = %category,
                    pending,
                    min_batch_size = self.config.min_batch_size,
                    "Batch below minimum size, extending once"
                );
            }
            short
        };

        if needs_grace {
            sleep(timeout).await;
        }

        if let Err(e) = self.flush(category, FlushTrigger::Timer(epoch)) {
            warn!(category = %category, error = %e, "Timed flush failed");
        }
    }

    fn flush(self: &Arc<Self>, category: EventCategory, trigger: FlushTrigger) -> Result<Option<Batch>> {
        let mut state = self.state();
        self.take_and_emit(&mut state, category, trigger)
    }

    /// Emit up to `max_batch_size` pending items of `category` as one batch. Callers
    /// hold the state lock for the whole step, so a batch never outgrows the limit.
    fn take_and_emit(
        self: &Arc<Self>,
        state: &mut AggregatorState,
        category: EventCategory,
        trigger: FlushTrigger,
    ) -> Result<Option<Batch>> {
        let AggregatorState { categories, stats } = state;
        let Some(slot) = categories.get_mut(&category) else {
            return Ok(None);
        };

        if let FlushTrigger::Timer(epoch) = trigger {
            if slot.epoch != epoch {
                return Ok(None);
            }
            // The timer task is the caller; dropping the handle detaches it
            slot.timer.take();
        } else if let Some(timer) = slot.timer.take() {
            timer.abort();
        }

        if slot.pending.is_empty() {
            return Ok(None);
        }

        let take = slot.pending.len().min(self.config.max_batch_size.max(1));
        let rest = slot.pending.split_off(take);
        let items = std::mem::replace(&mut slot.pending, rest);
        slot.epoch += 1;

        let batch = match build_batch(category, &items) {
            Ok(batch) => batch,
            Err(e) => {
                restore_front(slot, items);
                self.arm_timer(category, slot);
                stats.flush_failures += 1;
                return Err(e);
            }
        };

        if self.batch_tx.send(batch.clone()).is_err() {
            // Nobody will anchor this batch; keep the items at the front so a later
            // flush sees them in their original order.
            restore_front(slot, items);
            self.arm_timer(category, slot);
            stats.flush_failures += 1;
            warn!(category = %category, "Batch channel closed, items returned to pending");
            return Err(AnchorError::ChannelClosed);
        }

        // Overflow left behind starts a fresh batch with its own timer
        if !slot.pending.is_empty() {
            self.arm_timer(category, slot);
        }

        stats.batches_emitted += 1;
        stats.items_batched += batch.len() as u64;
        match trigger {
            FlushTrigger::Size => stats.size_flushes += 1,
            FlushTrigger::Timer(_) => stats.timed_flushes += 1,
            FlushTrigger::Manual => {}
        }

        info!(
            batch_id = %batch.batch_id,
            category = %category,
            item_count = batch.len(),
            merkle_root = %batch.merkle_root,
            trigger = ?trigger,
            "Batch flushed"
        );

        Ok(Some(batch))
    }
}

fn restore_front(slot: &mut CategoryState, mut items: Vec<PendingItem>) {
    items.append(&mut slot.pending);
    slot.pending = items;
}

fn build_batch(category: EventCategory, items: &[PendingItem]) -> Result<Batch> {
    let leaves: Vec<Digest> = items.iter().map(|item| item.digest.clone()).collect();
    let tree = MerkleTree::build(leaves)?;
    let proofs = tree.generate_all_proofs();

    let batch_items = items
        .iter()
        .zip(proofs)
        .enumerate()
        .map(|(index, (item, proof))| BatchItem {
            category,
            payload_ref: item.payload_ref.clone(),
            digest: item.digest.clone(),
            index,
            proof,
        })
        .collect();

    Ok(Batch {
        batch_id: Uuid::new_v4(),
        merkle_root: tree.root().clone(),
        height: tree.height(),
        items: batch_items,
        created_at: Utc::now(),
        category,
    })
}

/// Per-category batch aggregator
#[derive(Clone)]
pub struct BatchAggregator {
    inner: Arc<Inner>,
}

impl BatchAggregator {
    /// Create an aggregator emitting flushed batches on `batch_tx`
    pub fn new(config: BatchConfig, batch_tx: mpsc::UnboundedSender<Batch>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(AggregatorState::default()),
                batch_tx,
            }),
        }
    }

    /// Hash `payload` and add it to the category's pending batch
    pub async fn add_item<T: Serialize + ?Sized>(
        &self,
        category: EventCategory,
        payload_ref: EntityRef,
        payload: &T,
    ) -> Result<ItemTicket> {
        let digest = digest(payload)?;
        self.add_digest(category, payload_ref, digest).await
    }

    /// Add an already-computed digest to the category's pending batch
    pub async fn add_digest(
        &self,
        category: EventCategory,
        payload_ref: EntityRef,
        digest: Digest,
    ) -> Result<ItemTicket> {
        let mut state = self.inner.state();
        state.stats.items_added += 1;
        let slot = state.categories.entry(category).or_default();
        slot.pending.push(PendingItem {
            payload_ref,
            digest: digest.clone(),
        });
        if slot.pending.len() == 1 {
            self.inner.arm_timer(category, slot);
        }
        let index = slot.pending.len() - 1;
        let full = slot.pending.len() >= self.inner.config.max_batch_size;

        // Push and size flush form one step under the lock
        let flushed_batch = if full {
            self.inner
                .take_and_emit(&mut state, category, FlushTrigger::Size)?
                .map(|batch| batch.batch_id)
        } else {
            None
        };
        drop(state);

        Ok(ItemTicket {
            category,
            digest,
            index,
            flushed_batch,
        })
    }

    /// Flush a category now, regardless of thresholds. At most `max_batch_size` items
    /// leave per call.
    pub async fn flush(&self, category: EventCategory) -> Result<Option<Batch>> {
        self.inner.flush(category, FlushTrigger::Manual)
    }

    /// Flush every category with pending items. Used at shutdown.
    pub async fn flush_all(&self) -> Result<Vec<Batch>> {
        let categories: Vec<EventCategory> = {
            let state = self.inner.state();
            state
                .categories
                .iter()
                .filter(|(_, slot)| !slot.pending.is_empty())
                .map(|(category, _)| *category)
                .collect()
        };

        let mut batches = Vec::new();
        let mut first_error = None;
        for category in categories {
            loop {
                match self.inner.flush(category, FlushTrigger::Manual) {
                    Ok(Some(batch)) => batches.push(batch),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(category = %category, error = %e, "Flush at shutdown failed");
                        first_error.get_or_insert(e);
                        break;
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(batches),
        }
    }

    pub fn pending_count(&self, category: EventCategory) -> usize {
        self.inner
            .state()
            .categories
            .get(&category)
            .map_or(0, |slot| slot.pending.len())
    }

    pub fn total_pending(&self) -> usize {
        self.inner
            .state()
            .categories
            .values()
            .map(|slot| slot.pending.len())
            .sum()
    }

    pub fn stats(&self) -> AggregatorStats {
        self.inner.state().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carechain_core::verify_proof;
    use serde_json::json;
    use std::time::Duration;

    fn config(max: usize, min: usize, timeout_ms: u64) -> BatchConfig {
        BatchConfig {
            max_batch_size: max,
            min_batch_size: min,
            batch_timeout_ms: timeout_ms,
        }
    }

    fn entity(id: &str) -> EntityRef {
        EntityRef::new("delivery", id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_at_max_size() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = BatchAggregator::new(config(3, 1, 60_000), tx);

        for i in 0..2 {
            let ticket = aggregator
                .add_item(EventCategory::Delivery, entity(&i.to_string()), &json!({ "n": i }))
                .await
                .unwrap();
            assert_eq!(ticket.index, i);
            assert!(ticket.flushed_batch.is_none());
        }
        let last = aggregator
            .add_item(EventCategory::Delivery, entity("2"), &json!({ "n": 2 }))
            .await
            .unwrap();

        let batch = rx.try_recv().unwrap();
        assert_eq!(last.flushed_batch, Some(batch.batch_id));
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.height, 2);
        assert_eq!(aggregator.pending_count(EventCategory::Delivery), 0);

        for item in &batch.items {
            assert!(verify_proof(&item.digest, &item.proof, &batch.merkle_root));
        }
        assert_eq!(aggregator.stats().size_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_grace_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = BatchAggregator::new(config(100, 10, 5_000), tx);

        for name in ["A", "B", "C"] {
            aggregator
                .add_item(EventCategory::Prescription, entity(name), &json!({ "rx": name }))
                .await
                .unwrap();
        }

        // First timeout: below the minimum, so one grace period is granted
        tokio::time::sleep(Duration::from_millis(5_001)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(aggregator.stats().grace_extensions, 1);

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.height, 2);

        let b = &batch.items[1];
        assert_eq!(b.payload_ref, entity("B"));
        assert_eq!(b.index, 1);
        assert_eq!(b.proof.len(), 2);
        assert!(verify_proof(&b.digest, &b.proof, &batch.merkle_root));
        assert_eq!(aggregator.stats().timed_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flush_at_min_size() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = BatchAggregator::new(config(5, 2, 5_000), tx);

        for name in ["A", "B", "C"] {
            aggregator
                .add_item(EventCategory::Delivery, entity(name), &json!({ "id": name }))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(aggregator.stats().grace_extensions, 0);

        let leaves: Vec<Digest> = batch.items.iter().map(|i| i.digest.clone()).collect();
        let rebuilt = MerkleTree::build(leaves).unwrap();
        assert_eq!(rebuilt.root(), &batch.merkle_root);

        let b = &batch.items[1];
        assert!(verify_proof(&b.digest, &b.proof, &batch.merkle_root));
    }

    #[tokio::test(start_paused = true)]
    async fn test_categories_are_independent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = BatchAggregator::new(config(2, 1, 60_000), tx);

        aggregator
            .add_item(EventCategory::Delivery, entity("d1"), &json!({ "d": 1 }))
            .await
            .unwrap();
        aggregator
            .add_item(EventCategory::AccessControl, entity("a1"), &json!({ "a": 1 }))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        aggregator
            .add_item(EventCategory::Delivery, entity("d2"), &json!({ "d": 2 }))
            .await
            .unwrap();
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.category, EventCategory::Delivery);
        assert_eq!(aggregator.pending_count(EventCategory::AccessControl), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush_cancels_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = BatchAggregator::new(config(100, 1, 1_000), tx);

        aggregator
            .add_item(EventCategory::MedicalRecord, entity("m1"), &json!({ "m": 1 }))
            .await
            .unwrap();
        let batch = aggregator.flush(EventCategory::MedicalRecord).await.unwrap().unwrap();
        assert_eq!(rx.try_recv().unwrap().batch_id, batch.batch_id);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert!(aggregator.flush(EventCategory::MedicalRecord).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_keeps_items_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let aggregator = BatchAggregator::new(config(100, 1, 60_000), tx);

        for i in 0..3 {
            aggregator
                .add_item(EventCategory::Delivery, entity(&i.to_string()), &json!({ "n": i }))
                .await
                .unwrap();
        }

        let err = aggregator.flush(EventCategory::Delivery).await.unwrap_err();
        assert!(matches!(err, AnchorError::ChannelClosed));
        assert_eq!(aggregator.pending_count(EventCategory::Delivery), 3);
        assert_eq!(aggregator.stats().flush_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = BatchAggregator::new(config(100, 1, 60_000), tx);

        for category in [EventCategory::Delivery, EventCategory::Prescription] {
            aggregator
                .add_item(category, entity("x"), &json!({ "c": category.as_str() }))
                .await
                .unwrap();
        }

        let batches = aggregator.flush_all().await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(aggregator.total_pending(), 0);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_adds_never_exceed_max_size() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let aggregator = BatchAggregator::new(config(5, 1, 60_000), tx);

        let rounds = 20;
        let per_round = 200;
        for round in 0..rounds {
            let tasks: Vec<_> = (0..per_round)
                .map(|i| {
                    let aggregator = aggregator.clone();
                    tokio::spawn(async move {
                        aggregator
                            .add_item(
                                EventCategory::Delivery,
                                entity(&format!("{}-{}", round, i)),
                                &json!({ "round": round, "n": i }),
                            )
                            .await
                            .unwrap();
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }
        }
        aggregator.flush_all().await.unwrap();

        let mut total = 0;
        while let Ok(batch) = rx.try_recv() {
            assert!(batch.len() <= 5, "batch exceeded max_batch_size: {}", batch.len());
            total += batch.len();
        }
        assert_eq!(total, rounds * per_round);
        assert_eq!(aggregator.total_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_splits_oversized_backlog() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let aggregator = BatchAggregator::new(config(2, 1, 60_000), tx);

        // Size flushes fail on the closed channel, so the backlog grows past the limit
        for i in 0..5 {
            let _ = aggregator
                .add_item(EventCategory::Delivery, entity(&i.to_string()), &json!({ "n": i }))
                .await;
        }
        assert_eq!(aggregator.pending_count(EventCategory::Delivery), 5);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reopened = BatchAggregator {
            inner: Arc::new(Inner {
                config: aggregator.inner.config.clone(),
                state: Mutex::new(std::mem::take(&mut *aggregator.inner.state())),
                batch_tx: tx,
            }),
        };

        let batches = reopened.flush_all().await.unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(rx.try_recv().unwrap().items[0].payload_ref, entity("0"));
        assert_eq!(reopened.total_pending(), 0);
    }
}
