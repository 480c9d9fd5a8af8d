//! The operation scheduler.
//!
//! All deferred work (distributions, consolidations, CoinJoin ticks,
//! rebalances, cleanup) flows through one priority queue with per-kind
//! concurrency caps, exponential-backoff retries, and timing jitter. Every
//! state transition is persisted before the in-memory copy is treated as
//! authoritative, so a restart rehydrates the exact set of live operations.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use tumbler_types::config::SchedulerConfig;
use tumbler_types::schedule::{OperationKind, OperationStatus, ScheduledOperation};
use tumbler_types::OperationId;

use crate::events::{EngineEvent, EventBus};
use crate::traits::Repository;
use crate::EngineError;

/// Cooperative cancellation handle. Operations observe it between atomic
/// steps; cancellation never interrupts a step in flight.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(AtomicOrdering::SeqCst)
    }
}

/// Implemented per operation kind; registered with the scheduler before
/// start.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, op: &ScheduledOperation, cancel: &CancelToken) -> Result<(), EngineError>;
}

/// Queue slot ordering: priority 1 first, ties broken by `scheduled_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueSlot {
    priority: u8,
    scheduled_at: DateTime<Utc>,
    id: OperationId,
}

impl Ord for QueueSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest priority number
        // and earliest time surface first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.scheduled_at.cmp(&self.scheduled_at))
            .then_with(|| other.id.0.cmp(&self.id.0))
    }
}

impl PartialOrd for QueueSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SchedulerState {
    operations: HashMap<OperationId, ScheduledOperation>,
    queue: BinaryHeap<QueueSlot>,
    executing: HashMap<OperationId, CancelToken>,
    in_flight_by_kind: HashMap<OperationKind, usize>,
}

/// Aggregate scheduler numbers, logged by the stats timer.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub scheduled: usize,
    pub queued: usize,
    pub executing: usize,
    pub retry_pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    repository: Arc<dyn Repository>,
    events: EventBus,
    executors: std::sync::RwLock<HashMap<OperationKind, Arc<dyn OperationExecutor>>>,
    state: Mutex<SchedulerState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn Repository>,
        events: EventBus,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Scheduler {
            config,
            repository,
            events,
            executors: std::sync::RwLock::new(HashMap::new()),
            state: Mutex::new(SchedulerState::default()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn register_executor(&self, kind: OperationKind, executor: Arc<dyn OperationExecutor>) {
        self.executors
            .write()
            .expect("executor table poisoned")
            .insert(kind, executor);
    }

    /// Accept an operation. Non-CoinJoin kinds get up to `max_jitter_secs`
    /// of uniform random delay added to blur timing correlations; CoinJoin
    /// times are left exact, coordination needs them.
    pub async fn schedule(&self, mut op: ScheduledOperation) -> Result<OperationId, EngineError> {
        op.scheduled_at = op.scheduled_at + self.jitter_for(op.kind);
        op.status = OperationStatus::Scheduled;
        self.repository.put_operation(&op).await?;
        let id = op.id;
        let mut state = self.state.lock().await;
        state.operations.insert(id, op);
        debug!("scheduled operation {}", id);
        Ok(id)
    }

    fn jitter_for(&self, kind: OperationKind) -> ChronoDuration {
        if kind == OperationKind::Coinjoin || self.config.max_jitter_secs == 0 {
            return ChronoDuration::zero();
        }
        let secs = rand::thread_rng().gen_range(0..=self.config.max_jitter_secs);
        ChronoDuration::seconds(secs as i64)
    }

    /// Cancel an operation. Refused unless it is sitting in
    /// scheduled/queued/retry_pending. The transition is persisted before
    /// the in-memory copy changes, like every other transition here.
    pub async fn cancel(&self, id: OperationId) -> Result<(), EngineError> {
        let updated = {
            let state = self.state.lock().await;
            let op = state
                .operations
                .get(&id)
                .ok_or_else(|| EngineError::Internal(format!("unknown operation {}", id)))?;
            if !op.status.is_cancellable() {
                return Err(EngineError::WrongStatus(
                    format!("{:?}", op.status),
                    "cancelled".into(),
                ));
            }
            let mut updated = op.clone();
            updated.status = OperationStatus::Cancelled;
            updated
        };
        self.repository.put_operation(&updated).await?;
        {
            let mut state = self.state.lock().await;
            state.operations.insert(id, updated.clone());
        }
        self.events.emit(EngineEvent::OperationFinished {
            id,
            kind: updated.kind,
            status: OperationStatus::Cancelled,
        });
        Ok(())
    }

    /// Reload live operations after a restart: everything non-terminal,
    /// scheduled inside the TTL window, with its original `scheduled_at`.
    pub async fn rehydrate(&self) -> Result<usize, EngineError> {
        let horizon = Utc::now() - ChronoDuration::seconds(self.config.operation_ttl_secs as i64);
        let ops = self
            .repository
            .load_operations(
                &[
                    OperationStatus::Scheduled,
                    OperationStatus::Queued,
                    OperationStatus::RetryPending,
                ],
                horizon,
            )
            .await?;
        let mut state = self.state.lock().await;
        let count = ops.len();
        for op in ops {
            if op.status == OperationStatus::Queued {
                state.queue.push(QueueSlot {
                    priority: op.priority,
                    scheduled_at: op.scheduled_at,
                    id: op.id,
                });
            }
            state.operations.insert(op.id, op);
        }
        info!("rehydrated {} operations", count);
        Ok(count)
    }

    /// Spawn the periodic drivers: schedule scanner, execution pump, cleanup,
    /// and stats aggregation.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_loop(self.config.schedule_check_interval_secs, |s| async move {
                s.scan_ready().await;
            }),
            self.spawn_loop(self.config.execution_pump_interval_secs, |s| async move {
                s.pump().await;
            }),
            self.spawn_loop(self.config.cleanup_interval_secs, |s| async move {
                s.cleanup_sweep().await;
            }),
            self.spawn_loop(self.config.stats_interval_secs, |s| async move {
                let stats = s.stats().await;
                info!(
                    "scheduler: {} scheduled, {} queued, {} executing, {} retry, {} completed, {} failed, {} cancelled",
                    stats.scheduled,
                    stats.queued,
                    stats.executing,
                    stats.retry_pending,
                    stats.completed,
                    stats.failed,
                    stats.cancelled
                );
            }),
        ]
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, period_secs: u64, body: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Scheduler>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(period_secs.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => body(Arc::clone(&scheduler)).await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Move due scheduled/retry_pending operations into the queue.
    pub async fn scan_ready(&self) {
        let now = Utc::now();
        let due: Vec<ScheduledOperation> = {
            let state = self.state.lock().await;
            state
                .operations
                .values()
                .filter(|op| {
                    matches!(
                        op.status,
                        OperationStatus::Scheduled | OperationStatus::RetryPending
                    ) && op.scheduled_at <= now
                })
                .cloned()
                .collect()
        };

        for mut op in due {
            op.status = OperationStatus::Queued;
            if let Err(e) = self.repository.put_operation(&op).await {
                error!("failed to persist queue transition for {}: {}", op.id, e);
                continue;
            }
            let mut state = self.state.lock().await;
            state.queue.push(QueueSlot {
                priority: op.priority,
                scheduled_at: op.scheduled_at,
                id: op.id,
            });
            state.operations.insert(op.id, op);
        }
    }

    /// Fill free execution slots from the queue.
    pub async fn pump(self: &Arc<Self>) {
        loop {
            let next = self.take_next_runnable().await;
            let op = match next {
                Some(op) => op,
                None => break,
            };
            if let Err(e) = self.launch(op).await {
                error!("failed to launch operation: {}", e);
            }
        }
    }

    /// Pop the best runnable queue entry, honoring global and per-kind caps.
    /// Entries whose kind is saturated are set aside and requeued.
    async fn take_next_runnable(&self) -> Option<ScheduledOperation> {
        let mut state = self.state.lock().await;
        if state.executing.len() >= self.config.max_concurrent_operations {
            return None;
        }
        let mut skipped: Vec<QueueSlot> = Vec::new();
        let mut found = None;
        while let Some(slot) = state.queue.pop() {
            let op = match state.operations.get(&slot.id) {
                Some(op) if op.status == OperationStatus::Queued => op.clone(),
                // Stale slot (cancelled or already moved); drop it.
                _ => continue,
            };
            let in_flight = state.in_flight_by_kind.get(&op.kind).copied().unwrap_or(0);
            if in_flight >= self.config.kind_cap(op.kind) {
                skipped.push(slot);
                continue;
            }
            found = Some(op);
            break;
        }
        for slot in skipped {
            state.queue.push(slot);
        }
        found
    }

    async fn launch(self: &Arc<Self>, mut op: ScheduledOperation) -> Result<(), EngineError> {
        let executor = {
            let executors = self.executors.read().expect("executor table poisoned");
            executors.get(&op.kind).cloned()
        };
        let executor = match executor {
            Some(e) => e,
            None => {
                warn!("no executor registered for {}", op.kind);
                return self.finish(op.id, Err(EngineError::Internal("no executor".into()))).await;
            }
        };

        op.status = OperationStatus::Executing;
        self.repository.put_operation(&op).await?;

        let token = CancelToken::default();
        {
            let mut state = self.state.lock().await;
            state.executing.insert(op.id, token.clone());
            *state.in_flight_by_kind.entry(op.kind).or_insert(0) += 1;
            state.operations.insert(op.id, op.clone());
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let result = executor.execute(&op, &token).await;
            if let Err(e) = scheduler.finish(op.id, result).await {
                error!("failed to finalize operation {}: {}", op.id, e);
            }
        });
        Ok(())
    }

    /// Record the outcome of an executed operation: completion, a retry with
    /// exponential backoff, or terminal failure.
    async fn finish(&self, id: OperationId, result: Result<(), EngineError>) -> Result<(), EngineError> {
        let mut op = {
            let mut state = self.state.lock().await;
            state.executing.remove(&id);
            let op = state
                .operations
                .get(&id)
                .cloned()
                .ok_or_else(|| EngineError::Internal(format!("finishing unknown operation {}", id)))?;
            if let Some(count) = state.in_flight_by_kind.get_mut(&op.kind) {
                *count = count.saturating_sub(1);
            }
            op
        };

        match result {
            Ok(()) => {
                op.status = OperationStatus::Completed;
                op.last_error = None;
            }
            Err(EngineError::Cancelled) => {
                op.status = OperationStatus::Cancelled;
                op.last_error = Some("cancelled".into());
            }
            Err(e) if e.is_retryable() && op.retry_count < self.config.max_retry_attempts => {
                op.retry_count += 1;
                let backoff = self.config.min_delay_secs as f64
                    * self
                        .config
                        .retry_backoff_multiplier
                        .powi(op.retry_count as i32 - 1);
                op.scheduled_at =
                    Utc::now() + ChronoDuration::seconds(backoff as i64) + self.jitter_for(op.kind);
                op.status = OperationStatus::RetryPending;
                op.last_error = Some(e.to_string());
                warn!(
                    "operation {} failed ({}), retry {} in ~{}s",
                    id, e, op.retry_count, backoff as i64
                );
            }
            Err(e) => {
                op.status = OperationStatus::Failed;
                op.last_error = Some(e.to_string());
                warn!("operation {} failed terminally: {}", id, e);
            }
        }

        self.repository.put_operation(&op).await?;
        {
            let mut state = self.state.lock().await;
            state.operations.insert(id, op.clone());
        }
        if op.status.is_terminal() || op.status == OperationStatus::RetryPending {
            self.events.emit(EngineEvent::OperationFinished {
                id,
                kind: op.kind,
                status: op.status,
            });
        }
        Ok(())
    }

    /// Cancel operations that outlived the TTL without reaching a terminal
    /// state.
    pub async fn cleanup_sweep(&self) {
        let horizon = Utc::now() - ChronoDuration::seconds(self.config.operation_ttl_secs as i64);
        let stale: Vec<OperationId> = {
            let state = self.state.lock().await;
            state
                .operations
                .values()
                .filter(|op| !op.status.is_terminal() && op.created_at < horizon)
                .filter(|op| op.status.is_cancellable())
                .map(|op| op.id)
                .collect()
        };
        for id in stale {
            if let Err(e) = self.cancel(id).await {
                warn!("cleanup could not cancel {}: {}", id, e);
            } else {
                info!("cleanup cancelled stale operation {}", id);
            }
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        let mut stats = SchedulerStats::default();
        for op in state.operations.values() {
            match op.status {
                OperationStatus::Scheduled => stats.scheduled += 1,
                OperationStatus::Queued => stats.queued += 1,
                OperationStatus::Executing => stats.executing += 1,
                OperationStatus::RetryPending => stats.retry_pending += 1,
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Current in-memory view of an operation.
    pub async fn get(&self, id: OperationId) -> Option<ScheduledOperation> {
        self.state.lock().await.operations.get(&id).cloned()
    }
}
