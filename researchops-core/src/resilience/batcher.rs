//! Request batcher.
//!
//! Smooths bursts of concurrent requests by collecting them into batches that
//! are processed together. A background task reads an unbounded channel,
//! waiting up to `batch_timeout` for each further request. It flushes a batch
//! when it reaches `batch_size`, or when that wait elapses with a partial
//! batch. Requests that already waited `max_wait` are flushed on their own.
//!
//! Every request in a batch runs concurrently and resolves only its own
//! result channel. Stopping the batcher keeps unprocessed requests (including
//! a partially collected batch) so a later `start()` resumes them.
//!
//! A finished request stays collectable for `result_ttl`. After that the
//! running loop evicts it, so results nobody polls for do not accumulate.

use crate::config::BatcherConfig;
use crate::error::{BatchError, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Function that processes one request of a batch.
pub type Processor<P, R> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// Lifecycle of a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting to be assembled into a batch.
    Queued,
    /// Handed to the processor.
    Processing,
    /// Result is ready to be collected.
    Completed,
}

/// Diagnostic view of a request that has not been collected yet.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub submitted_at: DateTime<Utc>,
    pub waited: Duration,
}

struct Queued<P, R> {
    id: Uuid,
    params: P,
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<R>>,
}

struct Slot<R> {
    enqueued_at: Instant,
    submitted_at: DateTime<Utc>,
    status: RequestStatus,
    completed_at: Option<Instant>,
    receiver: Option<oneshot::Receiver<Result<R>>>,
}

type Slots<R> = Arc<Mutex<HashMap<Uuid, Slot<R>>>>;

fn lock_slots<R>(slots: &Mutex<HashMap<Uuid, Slot<R>>>) -> MutexGuard<'_, HashMap<Uuid, Slot<R>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_status<R>(slots: &Mutex<HashMap<Uuid, Slot<R>>>, id: Uuid, status: RequestStatus) {
    if let Some(slot) = lock_slots(slots).get_mut(&id) {
        slot.status = status;
        if status == RequestStatus::Completed {
            slot.completed_at = Some(Instant::now());
        }
    }
}

/// Drop slots that finished at least `ttl` ago. Returns how many were removed.
fn evict_completed<R>(slots: &Mutex<HashMap<Uuid, Slot<R>>>, ttl: Duration) -> usize {
    let now = Instant::now();
    let mut slots = lock_slots(slots);
    let before = slots.len();
    slots.retain(|_, slot| {
        slot.completed_at.is_none_or(|done| now.saturating_duration_since(done) < ttl)
    });
    before - slots.len()
}

/// Receiving half of the queue plus any partially collected batch.
///
/// Owned by the background task while running and handed back on stop, so
/// nothing that was dequeued is ever lost.
struct Collector<P, R> {
    rx: mpsc::UnboundedReceiver<Queued<P, R>>,
    partial: Vec<Queued<P, R>>,
}

impl<P, R> Collector<P, R> {
    /// Wait for the next batch (or batches) to flush.
    ///
    /// Cancel-safe: requests are moved into `self.partial` before the next
    /// await point, and `recv` itself is cancel-safe.
    async fn next_batches(&mut self, config: &BatcherConfig) -> Option<Vec<Vec<Queued<P, R>>>> {
        loop {
            let next = if self.partial.is_empty() {
                self.rx.recv().await
            } else {
                match tokio::time::timeout(config.batch_timeout(), self.rx.recv()).await {
                    Ok(item) => item,
                    Err(_) => return Some(vec![std::mem::take(&mut self.partial)]),
                }
            };

            let Some(item) = next else {
                if self.partial.is_empty() {
                    return None;
                }
                return Some(vec![std::mem::take(&mut self.partial)]);
            };

            if item.enqueued_at.elapsed() >= config.max_wait() {
                let mut batches = Vec::with_capacity(2);
                if !self.partial.is_empty() {
                    batches.push(std::mem::take(&mut self.partial));
                }
                batches.push(vec![item]);
                return Some(batches);
            }

            self.partial.push(item);
            if self.partial.len() >= config.batch_size {
                return Some(vec![std::mem::take(&mut self.partial)]);
            }
        }
    }
}

enum LoopState<P, R> {
    Idle(Collector<P, R>),
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<Collector<P, R>>,
    },
    /// The background task died and took the queue with it.
    Broken,
}

/// Batches requests of type `P` into concurrent processor calls returning `R`.
pub struct RequestBatcher<P, R> {
    config: BatcherConfig,
    processor: Option<Processor<P, R>>,
    tx: mpsc::UnboundedSender<Queued<P, R>>,
    slots: Slots<R>,
    state: Mutex<Option<LoopState<P, R>>>,
}

impl<P, R> RequestBatcher<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Create a batcher without a processor. Every request resolves to
    /// [`BatchError::NotImplemented`].
    pub fn new(config: BatcherConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a batcher that runs `processor` for every request.
    pub fn with_processor<F, Fut>(config: BatcherConfig, processor: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let processor: Processor<P, R> = Arc::new(move |params| Box::pin(processor(params)));
        Self::build(config, Some(processor))
    }

    fn build(config: BatcherConfig, processor: Option<Processor<P, R>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            processor,
            tx,
            slots: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(Some(LoopState::Idle(Collector {
                rx,
                partial: Vec::new(),
            }))),
        }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Whether the background task is running.
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), Some(LoopState::Running { .. }))
    }

    /// Spawn the background collection task. Must be called from within a
    /// tokio runtime. Starting a running batcher is a no-op.
    pub fn start(&self) -> std::result::Result<(), BatchError> {
        let mut state = self.lock_state();
        let collector = match state.take() {
            Some(LoopState::Idle(collector)) => collector,
            Some(LoopState::Broken) => {
                *state = Some(LoopState::Broken);
                return Err(BatchError::NotRunning);
            }
            // A concurrent stop() is still draining the task.
            None => return Err(BatchError::NotRunning),
            running @ Some(LoopState::Running { .. }) => {
                *state = running;
                return Ok(());
            }
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            collector,
            self.config.clone(),
            self.processor.clone(),
            Arc::clone(&self.slots),
            cancel.clone(),
        ));
        *state = Some(LoopState::Running { cancel, handle });
        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout_ms,
            "Request batcher started"
        );
        Ok(())
    }

    /// Stop the background task and wait for it to finish.
    ///
    /// A batch already being processed runs to completion. Requests not yet
    /// dispatched stay queued until the next `start()`.
    pub async fn stop(&self) {
        let running = {
            let mut state = self.lock_state();
            match state.take() {
                Some(LoopState::Running { cancel, handle }) => Some((cancel, handle)),
                other => {
                    *state = other;
                    None
                }
            }
        };

        let Some((cancel, handle)) = running else {
            return;
        };

        cancel.cancel();
        let next = match handle.await {
            Ok(collector) => LoopState::Idle(collector),
            Err(e) => {
                warn!(error = %e, "Request batcher task ended abnormally");
                LoopState::Broken
            }
        };
        *self.lock_state() = Some(next);
        info!("Request batcher stopped");
    }

    /// Enqueue a request and return its id.
    pub fn add_request(&self, params: P) -> std::result::Result<Uuid, BatchError> {
        let id = Uuid::new_v4();
        let (reply, receiver) = oneshot::channel();
        let enqueued_at = Instant::now();

        lock_slots(&self.slots).insert(
            id,
            Slot {
                enqueued_at,
                submitted_at: Utc::now(),
                status: RequestStatus::Queued,
                completed_at: None,
                receiver: Some(receiver),
            },
        );

        let queued = Queued {
            id,
            params,
            enqueued_at,
            reply,
        };
        if self.tx.send(queued).is_err() {
            lock_slots(&self.slots).remove(&id);
            return Err(BatchError::NotRunning);
        }
        debug!(request_id = %id, "Request enqueued");
        Ok(id)
    }

    /// Wait up to `timeout` for the result of `request_id`.
    ///
    /// A timeout does not cancel processing; the caller may poll again. Once
    /// a result has been returned the request is forgotten. Only one caller
    /// may wait on a given request at a time.
    pub async fn get_result(&self, request_id: Uuid, timeout: Duration) -> Result<R> {
        let mut receiver = lock_slots(&self.slots)
            .get_mut(&request_id)
            .and_then(|slot| slot.receiver.take())
            .ok_or(BatchError::UnknownRequest { request_id })?;

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(result)) => {
                lock_slots(&self.slots).remove(&request_id);
                result
            }
            Ok(Err(_)) => {
                lock_slots(&self.slots).remove(&request_id);
                Err(BatchError::Cancelled { request_id }.into())
            }
            Err(_) => {
                if let Some(slot) = lock_slots(&self.slots).get_mut(&request_id) {
                    slot.receiver = Some(receiver);
                }
                Err(BatchError::Timeout {
                    request_id,
                    timeout,
                }
                .into())
            }
        }
    }

    /// Evict finished results older than `result_ttl` now, instead of
    /// waiting for the running loop's next sweep.
    pub fn cleanup_completed(&self) -> usize {
        evict_completed(&self.slots, self.config.result_ttl())
    }

    /// Number of requests not yet handed to the processor.
    pub fn get_queue_size(&self) -> usize {
        lock_slots(&self.slots)
            .values()
            .filter(|slot| slot.status == RequestStatus::Queued)
            .count()
    }

    /// Every request whose result has not been collected or evicted, oldest first.
    pub fn get_pending_requests(&self) -> Vec<PendingRequest> {
        let now = Instant::now();
        let mut pending: Vec<(Instant, PendingRequest)> = lock_slots(&self.slots)
            .iter()
            .map(|(id, slot)| {
                (
                    slot.enqueued_at,
                    PendingRequest {
                        request_id: *id,
                        status: slot.status,
                        submitted_at: slot.submitted_at,
                        waited: now.saturating_duration_since(slot.enqueued_at),
                    },
                )
            })
            .collect();
        pending.sort_by_key(|(enqueued_at, _)| *enqueued_at);
        pending.into_iter().map(|(_, request)| request).collect()
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<LoopState<P, R>>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P, R> Drop for RequestBatcher<P, R> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(LoopState::Running { cancel, .. }) = state.take() {
                cancel.cancel();
            }
        }
    }
}

async fn run_loop<P, R>(
    mut collector: Collector<P, R>,
    config: BatcherConfig,
    processor: Option<Processor<P, R>>,
    slots: Slots<R>,
    cancel: CancellationToken,
) -> Collector<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    let ttl = config.result_ttl();
    let mut sweep = tokio::time::interval((ttl / 2).max(Duration::from_millis(1)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let batches = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let evicted = evict_completed(&slots, ttl);
                if evicted > 0 {
                    debug!(evicted, "Evicted uncollected results");
                }
                continue;
            }
            batches = collector.next_batches(&config) => batches,
        };
        let Some(batches) = batches else {
            break;
        };

        let mut tasks = JoinSet::new();
        for batch in batches {
            debug!(size = batch.len(), "Flushing batch");
            for item in batch {
                set_status(&slots, item.id, RequestStatus::Processing);
                let processor = processor.clone();
                let slots = Arc::clone(&slots);
                tasks.spawn(async move {
                    let request_id = item.id;
                    let result = match processor {
                        Some(process) => process(item.params).await,
                        None => Err(BatchError::NotImplemented { request_id }.into()),
                    };
                    set_status(&slots, request_id, RequestStatus::Completed);
                    // The caller may have given up; nothing to do then.
                    let _ = item.reply.send(result);
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Batched request task did not complete");
            }
        }
    }

    debug!(
        partial = collector.partial.len(),
        "Batch collection loop exiting"
    );
    collector
}
