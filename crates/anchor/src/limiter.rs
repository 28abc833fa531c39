//! Token-bucket rate limiter for ledger submissions.
//!
//! Tokens refill continuously at `max_ops_per_second` up to `capacity`. Callers that
//! find the bucket empty wait in strict FIFO order; a single releaser task hands out
//! one token at a time with `release_interval` between consecutive releases.

use carechain_core::RateLimitConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Window used for the current-throughput figure
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub average_wait_ms: f64,
    pub peak_queue_depth: usize,
    pub current_queue_depth: usize,
    /// Grants within the last second
    pub current_throughput: usize,
}

struct Waiter {
    tx: oneshot::Sender<()>,
    enqueued_at: Instant,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    waiters: VecDeque<Waiter>,
    releaser_running: bool,
    total_requests: u64,
    throttled_requests: u64,
    grants: u64,
    total_wait: Duration,
    peak_queue_depth: usize,
    recent_grants: VecDeque<Instant>,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }

    fn record_grant(&mut self, now: Instant, waited: Duration) {
        self.grants += 1;
        self.total_wait += waited;
        self.recent_grants.push_back(now);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.recent_grants.front() {
            if now.saturating_duration_since(*front) >= THROUGHPUT_WINDOW {
                self.recent_grants.pop_front();
            } else {
                break;
            }
        }
    }
}

struct Shared {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capacity(&self) -> f64 {
        f64::from(self.config.capacity.max(1))
    }

    fn rate(&self) -> f64 {
        f64::from(self.config.max_ops_per_second.max(1))
    }
}

/// Token-bucket limiter shared by every submission path
#[derive(Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let tokens = f64::from(config.capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(BucketState {
                    tokens,
                    last_refill: Instant::now(),
                    waiters: VecDeque::new(),
                    releaser_running: false,
                    total_requests: 0,
                    throttled_requests: 0,
                    grants: 0,
                    total_wait: Duration::ZERO,
                    peak_queue_depth: 0,
                    recent_grants: VecDeque::new(),
                }),
            }),
        }
    }

    /// Wait for a token. Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let shared = &self.shared;
        let rx = {
            let mut state = shared.state();
            let now = Instant::now();
            state.total_requests += 1;

            if !shared.config.enabled {
                state.record_grant(now, Duration::ZERO);
                return Duration::ZERO;
            }

            state.refill(now, shared.capacity(), shared.rate());
            if state.waiters.is_empty() && state.tokens >= 1.0 {
                state.tokens -= 1.0;
                state.record_grant(now, Duration::ZERO);
                return Duration::ZERO;
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                tx,
                enqueued_at: now,
            });
            state.throttled_requests += 1;
            state.peak_queue_depth = state.peak_queue_depth.max(state.waiters.len());
            trace!(queue_depth = state.waiters.len(), "Submission throttled");

            if !state.releaser_running {
                state.releaser_running = true;
                tokio::spawn(release_loop(Arc::clone(shared)));
            }
            rx
        };

        let started = Instant::now();
        // The releaser only drops a sender after the waiter was granted or the
        // runtime is shutting down; either way there is nothing left to wait for.
        let _ = rx.await;
        started.elapsed()
    }

    /// Tokens currently in the bucket, after refill
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.shared.state();
        state.refill(Instant::now(), self.shared.capacity(), self.shared.rate());
        state.tokens
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.state().waiters.len()
    }

    pub fn stats(&self) -> LimiterStats {
        let mut state = self.shared.state();
        state.prune(Instant::now());
        let average_wait_ms = if state.grants == 0 {
            0.0
        } else {
            state.total_wait.as_secs_f64() * 1000.0 / state.grants as f64
        };
        LimiterStats {
            total_requests: state.total_requests,
            throttled_requests: state.throttled_requests,
            average_wait_ms,
            peak_queue_depth: state.peak_queue_depth,
            current_queue_depth: state.waiters.len(),
            current_throughput: state.recent_grants.len(),
        }
    }
}

async fn release_loop(shared: Arc<Shared>) {
    let release_interval = shared.config.release_interval();
    loop {
        let pause = {
            let mut state = shared.state();
            let now = Instant::now();
            state.refill(now, shared.capacity(), shared.rate());

            // Waiters whose acquire future was dropped give up their place
            while state.waiters.front().is_some_and(|w| w.tx.is_closed()) {
                state.waiters.pop_front();
            }

            if state.waiters.is_empty() {
                state.releaser_running = false;
                return;
            }

            if state.tokens >= 1.0 {
                if let Some(waiter) = state.waiters.pop_front() {
                    let waited = now.saturating_duration_since(waiter.enqueued_at);
                    if waiter.tx.send(()).is_ok() {
                        state.tokens -= 1.0;
                        state.record_grant(now, waited);
                        debug!(
                            waited_ms = waited.as_millis() as u64,
                            remaining = state.waiters.len(),
                            "Token released to waiter"
                        );
                    }
                }
                if state.waiters.is_empty() {
                    state.releaser_running = false;
                    return;
                }
                release_interval
            } else {
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / shared.rate()).max(release_interval)
            }
        };
        sleep(pause).await;
    }
}
