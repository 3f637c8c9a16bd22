// crates/datatrail-core/src/runtime/adapter.rs
// ============================================================================
// Module: Datatrail Concurrency Adapter
// Description: Row-level pipelining inside a transform with FIFO emission.
// Purpose: Let external-call transforms overlap rows while the orchestrator
//          still observes one result at a time, in submission order.
// Dependencies: crate::{core, interfaces}, std::sync, std::thread
// ============================================================================

//! ## Overview
//! The adapter owns a worker pool and a bounded submission queue. `accept`
//! blocks when the queue is full (backpressure); workers process rows
//! concurrently, but results are emitted strictly in submission (FIFO) order,
//! never completion order. A timed-out submission must be evicted so the FIFO
//! queue can drain past it. Capacity errors (rate limits, saturation) are
//! retried inside the worker with multiplicative backoff on the shared
//! dispatch delay and linear recovery on success, capped by
//! `max_capacity_retry_seconds`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;

use crate::core::contract::PipelineRow;
use crate::core::identifiers::TokenId;
use crate::interfaces::FailureKind;
use crate::interfaces::TransformPlugin;
use crate::interfaces::TransformResult;
use crate::interfaces::PluginContext;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Tuning knobs for the adapter.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Number of worker threads.
    pub pool_size: usize,
    /// Maximum submissions resident in the adapter (queued + in flight +
    /// unemitted results) before `accept` blocks.
    pub max_pending: usize,
    /// Total wall-clock budget for retrying capacity errors per row.
    pub max_capacity_retry_seconds: f64,
    /// Dispatch delay floor in milliseconds.
    pub min_dispatch_delay_ms: u64,
    /// Dispatch delay ceiling in milliseconds.
    pub max_dispatch_delay_ms: u64,
    /// Multiplicative factor applied to the dispatch delay on capacity
    /// errors.
    pub backoff_multiplier: f64,
    /// Linear decrement applied to the dispatch delay on success, in
    /// milliseconds.
    pub recovery_decrement_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_pending: 16,
            max_capacity_retry_seconds: 60.0,
            min_dispatch_delay_ms: 0,
            max_dispatch_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            recovery_decrement_ms: 50,
        }
    }
}

// ============================================================================
// SECTION: Worker Contract
// ============================================================================

/// Per-row processing function the pool invokes.
///
/// Implementations must be safe to call from multiple worker threads;
/// transforms without internal concurrency can wrap themselves in
/// [`MutexWorker`].
pub trait RowWorker: Send + Sync {
    /// Processes one row.
    fn process_row(&self, row: PipelineRow) -> TransformResult;
}

/// Serializing worker over a plain transform plugin.
pub struct MutexWorker {
    /// The wrapped transform.
    transform: Mutex<Box<dyn TransformPlugin>>,
    /// Context handed to every invocation.
    ctx: PluginContext,
}

impl MutexWorker {
    /// Wraps a transform so the pool can drive it one row at a time.
    #[must_use]
    pub fn new(transform: Box<dyn TransformPlugin>, ctx: PluginContext) -> Self {
        Self { transform: Mutex::new(transform), ctx }
    }
}

impl RowWorker for MutexWorker {
    fn process_row(&self, row: PipelineRow) -> TransformResult {
        match self.transform.lock() {
            Ok(mut transform) => transform.process(row, &self.ctx),
            Err(_) => TransformResult::error(
                Value::String("transform mutex poisoned".to_string()),
                false,
            ),
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors surfaced to the executor by the adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The waited-for submission did not complete in time. The executor must
    /// evict the submission to unblock the queue.
    #[error("submission for token '{0}' timed out")]
    Timeout(TokenId),
    /// The submission was evicted and will never produce a result.
    #[error("submission for token '{0}' was evicted")]
    Evicted(TokenId),
    /// The adapter has been shut down.
    #[error("adapter is shut down")]
    ShutDown,
    /// Internal synchronization failure.
    #[error("adapter state poisoned")]
    Poisoned,
}

// ============================================================================
// SECTION: Shared State
// ============================================================================

/// One queued submission.
struct Submission {
    /// Submission sequence number.
    seq: u64,
    /// Token the row belongs to.
    #[allow(dead_code, reason = "retained alongside row for future diagnostics; not read yet")]
    token_id: TokenId,
    /// The row to process.
    row: PipelineRow,
}

/// State guarded by the adapter mutex.
struct AdapterState {
    /// Submissions not yet picked up by a worker.
    queue: VecDeque<Submission>,
    /// Sequence numbers awaiting emission, in submission order.
    fifo: VecDeque<u64>,
    /// Completed results keyed by sequence number.
    results: BTreeMap<u64, TransformResult>,
    /// Token-to-sequence registry for waiters.
    token_seq: BTreeMap<TokenId, u64>,
    /// Evicted sequence numbers; late results are discarded.
    evicted: BTreeSet<u64>,
    /// Submissions currently being processed by workers.
    in_flight: usize,
    /// Next sequence number to assign.
    next_seq: u64,
    /// Current AIMD dispatch delay in milliseconds.
    dispatch_delay_ms: u64,
    /// True once shutdown has begun.
    shutdown: bool,
}

/// Shared adapter internals.
struct Shared {
    /// Guarded state.
    state: Mutex<AdapterState>,
    /// Signaled when queue space or new work appears.
    work_cv: Condvar,
    /// Signaled when a result lands or an eviction unblocks the FIFO.
    result_cv: Condvar,
}

// ============================================================================
// SECTION: Adapter
// ============================================================================

/// Bounded, FIFO-emitting concurrency adapter.
pub struct BatchAdapter {
    /// Shared state between the executor and workers.
    shared: Arc<Shared>,
    /// Adapter configuration.
    config: AdapterConfig,
    /// Worker thread handles.
    workers: Vec<JoinHandle<()>>,
}

impl BatchAdapter {
    /// Starts the adapter's worker pool over the given row worker.
    #[must_use]
    pub fn start(config: AdapterConfig, worker: Arc<dyn RowWorker>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(AdapterState {
                queue: VecDeque::new(),
                fifo: VecDeque::new(),
                results: BTreeMap::new(),
                token_seq: BTreeMap::new(),
                evicted: BTreeSet::new(),
                in_flight: 0,
                next_seq: 0,
                dispatch_delay_ms: config.min_dispatch_delay_ms,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            result_cv: Condvar::new(),
        });
        let workers = (0..config.pool_size.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                let worker = Arc::clone(&worker);
                let config = config.clone();
                std::thread::spawn(move || worker_loop(&shared, &config, worker.as_ref()))
            })
            .collect();
        Self { shared, config, workers }
    }

    /// Enqueues a row for processing, blocking while the adapter is at
    /// capacity.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::ShutDown`] after shutdown began.
    pub fn accept(&self, token_id: TokenId, row: PipelineRow) -> Result<(), AdapterError> {
        let mut state = self.shared.state.lock().map_err(|_| AdapterError::Poisoned)?;
        loop {
            if state.shutdown {
                return Err(AdapterError::ShutDown);
            }
            let resident = state.queue.len() + state.in_flight + state.results.len();
            if resident < self.config.max_pending {
                break;
            }
            state = self.shared.work_cv.wait(state).map_err(|_| AdapterError::Poisoned)?;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.fifo.push_back(seq);
        state.token_seq.insert(token_id.clone(), seq);
        state.queue.push_back(Submission { seq, token_id, row });
        self.shared.work_cv.notify_all();
        Ok(())
    }

    /// Waits for the result of a token's submission.
    ///
    /// Results are handed out strictly in submission order: this call blocks
    /// until the token's submission reaches the FIFO front and its result is
    /// available.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Timeout`] when the deadline passes,
    /// [`AdapterError::Evicted`] for evicted submissions, and
    /// [`AdapterError::ShutDown`] after shutdown.
    pub fn wait(
        &self,
        token_id: &TokenId,
        timeout: Duration,
    ) -> Result<TransformResult, AdapterError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().map_err(|_| AdapterError::Poisoned)?;
        let Some(seq) = state.token_seq.get(token_id).copied() else {
            return Err(AdapterError::Evicted(token_id.clone()));
        };
        loop {
            // Drop evicted submissions off the front so the queue drains.
            while let Some(front) = state.fifo.front().copied() {
                if state.evicted.contains(&front) && state.results.contains_key(&front) {
                    state.fifo.pop_front();
                    state.results.remove(&front);
                    state.evicted.remove(&front);
                    continue;
                }
                break;
            }
            if state.evicted.contains(&seq) {
                return Err(AdapterError::Evicted(token_id.clone()));
            }
            if state.fifo.front().copied() == Some(seq)
                && let Some(result) = state.results.remove(&seq)
            {
                state.fifo.pop_front();
                state.token_seq.remove(token_id);
                self.shared.work_cv.notify_all();
                return Ok(result);
            }
            if state.shutdown {
                return Err(AdapterError::ShutDown);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AdapterError::Timeout(token_id.clone()));
            }
            // On a timed-out wait the loop runs once more to catch a result
            // that raced the deadline, then exits through the deadline check.
            let (next, _) = self
                .shared
                .result_cv
                .wait_timeout(state, deadline - now)
                .map_err(|_| AdapterError::Poisoned)?;
            state = next;
        }
    }

    /// Evicts a submission so the FIFO can drain past it after a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Poisoned`] on synchronization failure.
    pub fn evict_submission(&self, token_id: &TokenId) -> Result<(), AdapterError> {
        let mut state = self.shared.state.lock().map_err(|_| AdapterError::Poisoned)?;
        let Some(seq) = state.token_seq.remove(token_id) else {
            return Ok(());
        };
        state.evicted.insert(seq);
        // Still queued: remove outright so no worker picks it up.
        if let Some(position) = state.queue.iter().position(|submission| submission.seq == seq) {
            state.queue.remove(position);
            state.results.insert(seq, TransformResult::timeout(Value::String(
                "submission evicted before dispatch".to_string(),
            )));
        }
        self.shared.result_cv.notify_all();
        self.shared.work_cv.notify_all();
        Ok(())
    }

    /// Drains outstanding work and joins the worker pool.
    pub fn shutdown_batch_processing(mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.shutdown = true;
        }
        self.shared.work_cv.notify_all();
        self.shared.result_cv.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Returns the number of resident submissions (queued, in flight, or
    /// unemitted).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| state.queue.len() + state.in_flight + state.results.len())
            .unwrap_or(0)
    }
}

// ============================================================================
// SECTION: Worker Loop
// ============================================================================

/// Body of each pool thread.
fn worker_loop(shared: &Shared, config: &AdapterConfig, worker: &dyn RowWorker) {
    loop {
        let (submission, delay_ms) = {
            let Ok(mut state) = shared.state.lock() else {
                return;
            };
            loop {
                if let Some(submission) = state.queue.pop_front() {
                    state.in_flight += 1;
                    break (submission, state.dispatch_delay_ms);
                }
                if state.shutdown {
                    return;
                }
                let Ok(next) = shared.work_cv.wait(state) else {
                    return;
                };
                state = next;
            }
        };
        if delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(delay_ms));
        }
        let result = process_with_capacity_retry(shared, config, worker, submission.row);
        let Ok(mut state) = shared.state.lock() else {
            return;
        };
        state.in_flight -= 1;
        state.results.insert(submission.seq, result);
        shared.result_cv.notify_all();
        shared.work_cv.notify_all();
    }
}

/// Runs one row, retrying capacity errors with AIMD pacing.
fn process_with_capacity_retry(
    shared: &Shared,
    config: &AdapterConfig,
    worker: &dyn RowWorker,
    row: PipelineRow,
) -> TransformResult {
    let started = Instant::now();
    let mut result = worker.process_row(row.clone());
    loop {
        match &result {
            TransformResult::Error(failure) if failure.kind == FailureKind::Capacity => {
                let backoff_ms = increase_dispatch_delay(shared, config);
                if started.elapsed().as_secs_f64() >= config.max_capacity_retry_seconds {
                    return TransformResult::error(
                        serde_json::json!({
                            "error": "capacity retries exhausted",
                            "last_reason": failure.reason,
                            "retried_for_seconds": started.elapsed().as_secs_f64(),
                        }),
                        false,
                    );
                }
                std::thread::sleep(Duration::from_millis(backoff_ms.max(1)));
                result = worker.process_row(row.clone());
            }
            _ => {
                decrease_dispatch_delay(shared, config);
                return result;
            }
        }
    }
}

/// Multiplicatively increases the shared dispatch delay, returning the new
/// value.
fn increase_dispatch_delay(shared: &Shared, config: &AdapterConfig) -> u64 {
    let Ok(mut state) = shared.state.lock() else {
        return config.max_dispatch_delay_ms;
    };
    let current = state.dispatch_delay_ms.max(1);
    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        reason = "Delay values are small; saturation is the desired behavior."
    )]
    let next = ((current as f64) * config.backoff_multiplier) as u64;
    state.dispatch_delay_ms = next.min(config.max_dispatch_delay_ms);
    state.dispatch_delay_ms
}

/// Linearly decreases the shared dispatch delay toward the floor.
fn decrease_dispatch_delay(shared: &Shared, config: &AdapterConfig) {
    if let Ok(mut state) = shared.state.lock() {
        state.dispatch_delay_ms = state
            .dispatch_delay_ms
            .saturating_sub(config.recovery_decrement_ms)
            .max(config.min_dispatch_delay_ms);
    }
}
