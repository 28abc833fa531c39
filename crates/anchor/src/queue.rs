//! Retry queue for failed submissions.
//!
//! Entries are retried by a single drain loop with exponential backoff
//! (`min(base * 2^(attempts - 1), max)`). An entry that exhausts `max_attempts`, or
//! fails with a non-retryable error, is completed as failed and raises an alert.
//!
//! Queue state lives in memory only. Entries pending at process exit are lost.

use crate::error::{AnchorError, Result};
use crate::message::AnchorMessage;
use async_trait::async_trait;
use carechain_core::logging::ALERT_TARGET;
use carechain_core::{AnchorReceipt, EventCategory, QueueConfig};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Completed entries kept for inspection
const COMPLETED_HISTORY: usize = 100;

/// Performs one submission attempt for a queued message
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, message: &AnchorMessage) -> Result<AnchorReceipt>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: Uuid,
    pub category: EventCategory,
    pub payload: AnchorMessage,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: QueueStatus,
    pub next_retry_at: Instant,
    pub last_error: Option<String>,
}

pub type SuccessCallback = Box<dyn FnOnce(AnchorReceipt) + Send>;
pub type FailureCallback = Box<dyn FnOnce(AnchorError) + Send>;

/// Callbacks invoked exactly once when an entry completes
#[derive(Default)]
pub struct Completion {
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl Completion {
    pub fn new<S, F>(on_success: S, on_failure: F) -> Self
    where
        S: FnOnce(AnchorReceipt) + Send + 'static,
        F: FnOnce(AnchorError) + Send + 'static,
    {
        Self {
            on_success: Some(Box::new(on_success)),
            on_failure: Some(Box::new(on_failure)),
        }
    }

    /// Completion delivered through a oneshot channel
    pub fn channel() -> (Self, oneshot::Receiver<Result<AnchorReceipt>>) {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_failure = Arc::clone(&tx);

        let send = |slot: &Mutex<Option<oneshot::Sender<Result<AnchorReceipt>>>>,
                    outcome: Result<AnchorReceipt>| {
            let sender = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(sender) = sender {
                let _ = sender.send(outcome);
            }
        };

        let completion = Self::new(
            move |receipt| send(&tx, Ok(receipt)),
            move |err| send(&tx_failure, Err(err)),
        );
        (completion, rx)
    }

    fn succeed(self, receipt: AnchorReceipt) {
        if let Some(cb) = self.on_success {
            cb(receipt);
        }
    }

    fn fail(self, err: AnchorError) {
        if let Some(cb) = self.on_failure {
            cb(err);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub enqueued_total: u64,
    pub attempts_total: u64,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub retries_scheduled: u64,
    pub alerts_raised: u64,
    pub depth: usize,
}

#[derive(Default)]
struct QueueState {
    entries: Vec<QueueEntry>,
    completions: HashMap<Uuid, Completion>,
    completed: VecDeque<QueueEntry>,
    draining: bool,
    stats: QueueStats,
}

impl QueueState {
    fn finish(&mut self, mut entry: QueueEntry, status: QueueStatus) -> Option<Completion> {
        entry.status = status;
        let completion = self.completions.remove(&entry.id);
        if self.completed.len() == COMPLETED_HISTORY {
            self.completed.pop_front();
        }
        self.completed.push_back(entry);
        completion
    }
}

enum Step {
    Attempt { id: Uuid, payload: AnchorMessage },
    Idle(Duration),
    Done,
}

struct Inner {
    config: QueueConfig,
    submitter: Arc<dyn Submitter>,
    state: Mutex<QueueState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_step(&self) -> Step {
        let mut state = self.state();
        if state.entries.is_empty() {
            state.draining = false;
            return Step::Done;
        }

        let now = Instant::now();
        let ready = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == QueueStatus::Pending && e.next_retry_at <= now)
            .min_by_key(|(_, e)| e.next_retry_at)
            .map(|(i, _)| i);

        match ready {
            Some(i) => {
                state.stats.attempts_total += 1;
                let entry = &mut state.entries[i];
                entry.attempts += 1;
                Step::Attempt {
                    id: entry.id,
                    payload: entry.payload.clone(),
                }
            }
            None => {
                let until_next = state
                    .entries
                    .iter()
                    .map(|e| e.next_retry_at.saturating_duration_since(now))
                    .min()
                    .unwrap_or_default();
                Step::Idle(until_next.min(self.config.idle_interval()))
            }
        }
    }

    fn complete(&self, id: Uuid, outcome: Result<AnchorReceipt>) {
        let (completion, result) = {
            let mut state = self.state();
            let Some(pos) = state.entries.iter().position(|e| e.id == id) else {
                return;
            };

            match outcome {
                Ok(mut receipt) => {
                    let entry = state.entries.remove(pos);
                    receipt.attempts = entry.attempts;
                    state.stats.succeeded_total += 1;
                    info!(
                        entry_id = %id,
                        category = %entry.category,
                        attempts = entry.attempts,
                        transaction_id = %receipt.ledger_transaction_id,
                        "Queued anchor succeeded"
                    );
                    (state.finish(entry, QueueStatus::Success), Ok(receipt))
                }
                Err(err) => {
                    let entry = &mut state.entries[pos];
                    entry.last_error = Some(err.to_string());
                    let attempts = entry.attempts;

                    if err.is_retryable() && attempts < entry.max_attempts {
                        let delay = self.config.backoff_delay(attempts);
                        entry.next_retry_at = Instant::now() + delay;
                        state.stats.retries_scheduled += 1;
                        warn!(
                            entry_id = %id,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %err,
                            "Anchor attempt failed, retry scheduled"
                        );
                        return;
                    }

                    let entry = state.entries.remove(pos);
                    state.stats.failed_total += 1;
                    state.stats.alerts_raised += 1;
                    error!(
                        target: ALERT_TARGET,
                        entry_id = %id,
                        category = %entry.category,
                        attempts,
                        error = %err,
                        "Anchoring permanently failed"
                    );

                    let err = if err.is_retryable() {
                        AnchorError::RetriesExhausted {
                            attempts,
                            last_error: err.to_string(),
                        }
                    } else {
                        err
                    };
                    (state.finish(entry, QueueStatus::Failed), Err(err))
                }
            }
        };

        if let Some(completion) = completion {
            match result {
                Ok(receipt) => completion.succeed(receipt),
                Err(err) => completion.fail(err),
            }
        }
    }
}

async fn drain(inner: Arc<Inner>) {
    debug!("Queue drain started");
    loop {
        match inner.next_step() {
            Step::Done => break,
            Step::Idle(pause) => sleep(pause).await,
            Step::Attempt { id, payload } => {
                let outcome = inner.submitter.submit(&payload).await;
                inner.complete(id, outcome);
            }
        }
    }
    debug!("Queue drained");
}

/// In-memory retry queue with a single drain loop
#[derive(Clone)]
pub struct AnchoringQueue {
    inner: Arc<Inner>,
}

impl AnchoringQueue {
    pub fn new(config: QueueConfig, submitter: Arc<dyn Submitter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                submitter,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Queue a message for submission. The drain loop picks it up immediately.
    pub fn enqueue(&self, payload: AnchorMessage, completion: Completion) -> Uuid {
        let id = Uuid::new_v4();
        let category = payload.category;
        let mut state = self.inner.state();
        state.entries.push(QueueEntry {
            id,
            category,
            payload,
            attempts: 0,
            max_attempts: self.inner.config.max_attempts,
            status: QueueStatus::Pending,
            next_retry_at: Instant::now(),
            last_error: None,
        });
        state.completions.insert(id, completion);
        state.stats.enqueued_total += 1;

        debug!(entry_id = %id, category = %category, depth = state.entries.len(), "Entry enqueued");

        if !state.draining {
            state.draining = true;
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }
        id
    }

    pub fn len(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending entries
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.inner.state().entries.clone()
    }

    /// Most recently completed entries, oldest first
    pub fn completed(&self) -> Vec<QueueEntry> {
        self.inner.state().completed.iter().cloned().collect()
    }

    /// Wait until no entries remain
    pub async fn drained(&self) {
        while !self.is_empty() {
            sleep(self.inner.config.idle_interval()).await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state();
        QueueStats {
            depth: state.entries.len(),
            ..state.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerError;
    use carechain_core::{digest_bytes, CoreError, EntityRef};
    use chrono::Utc;

    /// Fails the first `failures` calls with `error`, then succeeds
    struct ScriptedSubmitter {
        failures: u32,
        error: fn() -> AnchorError,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedSubmitter {
        fn new(failures: u32, error: fn() -> AnchorError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Submitter for ScriptedSubmitter {
        async fn submit(&self, _message: &AnchorMessage) -> Result<AnchorReceipt> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Instant::now());
                calls.len() as u32
            };
            if n <= self.failures {
                return Err((self.error)());
            }
            Ok(AnchorReceipt {
                ledger_transaction_id: format!("0.0.1001@1700000000.{:09}", n),
                topic_id: "0.0.5003".to_string(),
                sequence_number: 1,
                consensus_timestamp: Utc::now(),
                compressed: false,
                message_size: 100,
                compression_ratio: 1.0,
                response_time_ms: 1,
                attempts: 1,
                merkle_root: None,
                proof: None,
                batch_id: None,
            })
        }
    }

    fn busy() -> AnchorError {
        LedgerError::Busy("429".to_string()).into()
    }

    fn invalid() -> AnchorError {
        CoreError::InvalidBatch.into()
    }

    fn message() -> AnchorMessage {
        AnchorMessage::for_event(
            EventCategory::Delivery,
            &EntityRef::new("delivery", "d-1"),
            digest_bytes(b"d-1"),
        )
    }

    fn config(max_attempts: u32) -> QueueConfig {
        QueueConfig {
            max_attempts,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            idle_interval_ms: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_attempts() {
        let submitter = ScriptedSubmitter::new(u32::MAX, busy);
        let queue = AnchoringQueue::new(config(5), submitter.clone());
        let (completion, rx) = Completion::channel();

        let start = Instant::now();
        queue.enqueue(message(), completion);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, AnchorError::RetriesExhausted { attempts: 5, .. }));

        let offsets: Vec<u64> = submitter
            .call_times()
            .iter()
            .map(|t| (*t - start).as_millis() as u64)
            .collect();
        // Delays 1s, 2s, 4s, 8s between consecutive attempts
        assert_eq!(offsets, vec![0, 1_000, 3_000, 7_000, 15_000]);

        let completed = queue.completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, QueueStatus::Failed);
        assert_eq!(completed[0].attempts, 5);
        assert!(completed[0].last_error.is_some());

        let stats = queue.stats();
        assert_eq!(stats.alerts_raised, 1);
        assert_eq!(stats.attempts_total, 5);
        assert_eq!(stats.depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let submitter = ScriptedSubmitter::new(2, busy);
        let queue = AnchoringQueue::new(config(5), submitter.clone());
        let (completion, rx) = Completion::channel();

        queue.enqueue(message(), completion);
        let receipt = rx.await.unwrap().unwrap();

        assert_eq!(receipt.attempts, 3);
        assert_eq!(submitter.call_times().len(), 3);
        assert_eq!(queue.completed()[0].status, QueueStatus::Success);
        assert_eq!(queue.stats().retries_scheduled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_is_terminal() {
        let submitter = ScriptedSubmitter::new(u32::MAX, invalid);
        let queue = AnchoringQueue::new(config(5), submitter.clone());
        let (completion, rx) = Completion::channel();

        queue.enqueue(message(), completion);
        let err = rx.await.unwrap().unwrap_err();

        assert!(err.is_validation());
        assert_eq!(submitter.call_times().len(), 1);
        assert_eq!(queue.stats().retries_scheduled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_restarts_after_idle() {
        let submitter = ScriptedSubmitter::new(0, busy);
        let queue = AnchoringQueue::new(config(3), submitter.clone());

        let (first, rx1) = Completion::channel();
        queue.enqueue(message(), first);
        rx1.await.unwrap().unwrap();
        queue.drained().await;

        tokio::time::sleep(Duration::from_secs(1)).await;

        let (second, rx2) = Completion::channel();
        queue.enqueue(message(), second);
        rx2.await.unwrap().unwrap();

        assert_eq!(queue.stats().succeeded_total, 2);
    }
}
