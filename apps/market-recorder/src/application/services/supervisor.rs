//! Pipeline Supervisor
//!
//! Owns the record queues and the lifecycle of every pipeline task: one
//! collector and one writer per record kind.
//!
//! # Restarts
//!
//! Any task that ends while the pipeline is running (error, unexpected
//! return, or panic) is respawned after a backoff delay. The delay grows
//! per consecutive failure and resets once a run has stayed up for
//! `healthy_after`.
//!
//! # Shutdown
//!
//! ```text
//! stop token ─► cancel collector ─► await collector
//!           ─► drop queue senders ─► cancel writers (drain + flush)
//!           ─► await writers ─► abort stragglers at deadline
//!           ─► close storage clients and source
//! ```
//!
//! A single deadline bounds the whole sequence.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{Id as JoinId, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::collector::{Collector, CollectorConfig, CollectorError};
use super::queue::{QueueConfig, QueueSenders, QueueStatsSnapshot, RecordQueues};
use super::writer::{Writer, WriterConfig, WriterStats, WriterStatsSnapshot};
use crate::application::ports::{MarketDataSource, StorageBackend};
use crate::domain::record::RecordKind;
use crate::infrastructure::metrics;

/// How often queue depth and status are republished.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Restart Backoff
// =============================================================================

/// Restart delay settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    /// Delay before the first restart.
    pub base_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// A run at least this long resets the delay to base.
    pub healthy_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            healthy_after: Duration::from_secs(60),
        }
    }
}

/// Per-task restart backoff state.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    policy: RestartPolicy,
    consecutive: u32,
}

impl RestartBackoff {
    /// Create backoff state with no failures recorded.
    #[must_use]
    pub const fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
        }
    }

    /// Record a failure after a run of `ran_for` and return the delay
    /// before the next start.
    pub fn on_failure(&mut self, ran_for: Duration) -> Duration {
        if ran_for >= self.policy.healthy_after {
            self.consecutive = 0;
        }
        let delay = self.delay_for(self.consecutive);
        self.consecutive = self.consecutive.saturating_add(1);
        delay
    }

    /// Consecutive failures since the last healthy run.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let factor = self.policy.multiplier.max(1.0).powi(exponent);
        let secs = self.policy.base_delay.as_secs_f64() * factor;
        let max = self.policy.max_delay;
        if !secs.is_finite() || secs >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

// =============================================================================
// Task Identity and Status
// =============================================================================

/// A supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    /// The collector.
    Collector,
    /// The writer for one record kind.
    Writer(RecordKind),
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collector => f.write_str("collector"),
            Self::Writer(kind) => write!(f, "writer:{kind}"),
        }
    }
}

/// Overall pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    /// Tasks are being spawned.
    #[default]
    Starting,
    /// Normal operation.
    Running,
    /// Shutdown in progress.
    ShuttingDown,
    /// All tasks have ended.
    Stopped,
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Running normally.
    Running,
    /// Waiting out a restart delay.
    Restarting,
    /// Ended during shutdown.
    Stopped,
}

/// Status of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    /// Current state.
    pub state: TaskState,
    /// Restarts so far.
    pub restarts: u32,
    /// Error from the most recent failure.
    pub last_error: Option<String>,
}

/// Status of one record queue and its writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Records waiting.
    pub depth: usize,
    /// Queue counters.
    pub queue: QueueStatsSnapshot,
    /// Writer counters.
    pub writer: WriterStatsSnapshot,
}

/// Pipeline snapshot published for the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct PipelineStatus {
    /// Overall phase.
    pub phase: PipelinePhase,
    /// Per-task status, keyed by task name.
    pub tasks: BTreeMap<String, TaskStatus>,
    /// Per-kind queue status, keyed by record kind.
    pub queues: BTreeMap<String, QueueStatus>,
    /// Total restarts across all tasks.
    pub total_restarts: u64,
}

impl PipelineStatus {
    /// Whether every task is up and the pipeline is running.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase == PipelinePhase::Running
            && !self.tasks.is_empty()
            && self.tasks.values().all(|t| t.state == TaskState::Running)
    }
}

/// Outcome of a shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Tasks aborted because they missed the shutdown deadline.
    pub forced: Vec<TaskId>,
    /// Restarts performed over the pipeline's lifetime.
    pub restarts: u64,
}

impl ShutdownReport {
    /// Whether every task stopped on its own.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Supervisor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Collector settings.
    pub collector: CollectorConfig,
    /// Queue settings.
    pub queue: QueueConfig,
    /// Writer settings, shared by every writer.
    pub writer: WriterConfig,
    /// Restart backoff.
    pub restart: RestartPolicy,
    /// Deadline for the whole shutdown sequence.
    pub shutdown_timeout: Duration,
}

/// One storage backend per record kind.
#[derive(Clone)]
pub struct StorageBackends {
    /// Backend for trade records.
    pub trades: Arc<dyn StorageBackend>,
    /// Backend for binned book records.
    pub book_bins: Arc<dyn StorageBackend>,
    /// Backend for gap records.
    pub gaps: Arc<dyn StorageBackend>,
}

impl fmt::Debug for StorageBackends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageBackends").finish_non_exhaustive()
    }
}

impl StorageBackends {
    /// Use one backend for every record kind.
    #[must_use]
    pub fn shared(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            trades: Arc::clone(&backend),
            book_bins: Arc::clone(&backend),
            gaps: backend,
        }
    }

    /// Backend for a record kind.
    #[must_use]
    pub const fn for_kind(&self, kind: RecordKind) -> &Arc<dyn StorageBackend> {
        match kind {
            RecordKind::Trade => &self.trades,
            RecordKind::BookBin => &self.book_bins,
            RecordKind::Gap => &self.gaps,
        }
    }

    /// Close every distinct backend once.
    async fn close_all(&self) {
        let mut closed: Vec<&Arc<dyn StorageBackend>> = Vec::new();
        for kind in RecordKind::ALL {
            let backend = self.for_kind(kind);
            if closed.iter().any(|c| Arc::ptr_eq(c, backend)) {
                continue;
            }
            if let Err(e) = backend.close().await {
                tracing::warn!(kind = %kind, error = %e, "Failed to close storage client");
            }
            closed.push(backend);
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct Spawned {
    task: TaskId,
    started: Instant,
    delay: Duration,
}

/// Owns and restarts the pipeline tasks.
pub struct Supervisor {
    config: SupervisorConfig,
    source: Arc<dyn MarketDataSource>,
    storage: StorageBackends,
    status_tx: watch::Sender<PipelineStatus>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Mutable state of one supervisor run.
struct Runtime {
    senders: Option<QueueSenders>,
    queues: RecordQueues,
    writer_stats: HashMap<RecordKind, Arc<WriterStats>>,
    collectors: JoinSet<Result<(), CollectorError>>,
    writers: JoinSet<()>,
    spawned: HashMap<JoinId, Spawned>,
    backoff: HashMap<TaskId, RestartBackoff>,
    collector_cancel: CancellationToken,
    writer_cancel: CancellationToken,
    status: PipelineStatus,
}

impl Runtime {
    fn track(&mut self, id: JoinId, task: TaskId, delay: Duration) {
        self.spawned.insert(
            id,
            Spawned {
                task,
                started: Instant::now(),
                delay,
            },
        );
        let state = if delay.is_zero() {
            TaskState::Running
        } else {
            TaskState::Restarting
        };
        self.status
            .tasks
            .entry(task.to_string())
            .and_modify(|status| status.state = state)
            .or_insert(TaskStatus {
                state,
                restarts: 0,
                last_error: None,
            });
    }

    /// Count the batch a dead writer was holding as dropped.
    fn abandon_writer_batch(&self, kind: RecordKind) {
        let Some(stats) = self.writer_stats.get(&kind) else {
            return;
        };
        let lost = stats.abandon_pending();
        if lost > 0 {
            metrics::record_batch_dropped(kind, metrics::DropReason::TaskFailed, lost);
            tracing::error!(kind = %kind, records = lost, "Writer exited holding a batch, dropped");
        }
    }
}

impl Supervisor {
    /// Create a supervisor.
    #[must_use]
    pub fn new(
        config: SupervisorConfig,
        source: Arc<dyn MarketDataSource>,
        storage: StorageBackends,
    ) -> Self {
        let (status_tx, _) = watch::channel(PipelineStatus::default());
        Self {
            config,
            source,
            storage,
            status_tx,
        }
    }

    /// Subscribe to pipeline status updates.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<PipelineStatus> {
        self.status_tx.subscribe()
    }

    /// Run the pipeline until `shutdown` is cancelled, then stop it.
    pub async fn run(self, shutdown: CancellationToken) -> ShutdownReport {
        let (senders, queues) = RecordQueues::new(self.config.queue);
        let mut rt = Runtime {
            senders: Some(senders),
            queues,
            writer_stats: RecordKind::ALL
                .into_iter()
                .map(|kind| (kind, Arc::new(WriterStats::default())))
                .collect(),
            collectors: JoinSet::new(),
            writers: JoinSet::new(),
            spawned: HashMap::new(),
            backoff: HashMap::new(),
            collector_cancel: CancellationToken::new(),
            writer_cancel: CancellationToken::new(),
            status: PipelineStatus::default(),
        };

        for kind in RecordKind::ALL {
            self.spawn_writer(&mut rt, kind, Duration::ZERO);
        }
        self.spawn_collector(&mut rt, Duration::ZERO);
        rt.status.phase = PipelinePhase::Running;
        self.publish(&mut rt);

        tracing::info!(
            instrument = %self.config.collector.instrument,
            "Pipeline running"
        );

        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                Some(joined) = rt.collectors.join_next_with_id() => {
                    let (id, outcome) = collector_outcome(joined);
                    self.on_task_exit(&mut rt, id, outcome);
                }

                Some(joined) = rt.writers.join_next_with_id() => {
                    let (id, outcome) = writer_outcome(joined);
                    self.on_task_exit(&mut rt, id, outcome);
                }

                _ = ticker.tick() => self.publish(&mut rt),
            }
        }

        self.shutdown(rt).await
    }

    fn spawn_collector(&self, rt: &mut Runtime, delay: Duration) {
        let Some(senders) = rt.senders.clone() else {
            return;
        };
        let collector = Collector::new(
            self.config.collector.clone(),
            Arc::clone(&self.source),
            senders,
        );
        let cancel = rt.collector_cancel.clone();
        let handle = rt.collectors.spawn(async move {
            if !wait_restart_delay(delay, &cancel).await {
                return Ok(());
            }
            collector.run(cancel).await
        });
        rt.track(handle.id(), TaskId::Collector, delay);
    }

    fn spawn_writer(&self, rt: &mut Runtime, kind: RecordKind, delay: Duration) {
        let stats = rt
            .writer_stats
            .entry(kind)
            .or_insert_with(|| Arc::new(WriterStats::default()));
        let mut writer = Writer::new(
            kind,
            self.config.writer,
            Arc::clone(self.storage.for_kind(kind)),
            rt.queues.receiver(kind),
            Arc::clone(stats),
        );
        let cancel = rt.writer_cancel.clone();
        let handle = rt.writers.spawn(async move {
            if !wait_restart_delay(delay, &cancel).await {
                return;
            }
            writer.run(cancel).await;
        });
        rt.track(handle.id(), TaskId::Writer(kind), delay);
    }

    fn on_task_exit(&self, rt: &mut Runtime, id: JoinId, outcome: TaskOutcome) {
        let Some(spawned) = rt.spawned.remove(&id) else {
            tracing::warn!(task_id = %id, "Exit from untracked task");
            return;
        };
        let task = spawned.task;
        let ran_for = spawned.started.elapsed().saturating_sub(spawned.delay);

        let backoff = rt
            .backoff
            .entry(task)
            .or_insert_with(|| RestartBackoff::new(self.config.restart));
        let delay = backoff.on_failure(ran_for);
        let failures = backoff.consecutive_failures();

        let message = outcome.to_string();
        match outcome {
            TaskOutcome::Panicked(_) => tracing::error!(
                task = %task,
                ran_for_ms = ran_for.as_millis(),
                restart_in_ms = delay.as_millis(),
                consecutive = failures,
                error = %message,
                "Task panicked, restarting"
            ),
            TaskOutcome::Failed(_) | TaskOutcome::Returned => tracing::warn!(
                task = %task,
                ran_for_ms = ran_for.as_millis(),
                restart_in_ms = delay.as_millis(),
                consecutive = failures,
                error = %message,
                "Task ended, restarting"
            ),
        }

        if let TaskId::Writer(kind) = task {
            rt.abandon_writer_batch(kind);
        }

        metrics::record_task_restart(&task.to_string());
        rt.status.total_restarts += 1;
        let entry = rt
            .status
            .tasks
            .entry(task.to_string())
            .or_insert(TaskStatus {
                state: TaskState::Restarting,
                restarts: 0,
                last_error: None,
            });
        entry.restarts += 1;
        entry.last_error = Some(message);

        match task {
            TaskId::Collector => self.spawn_collector(rt, delay),
            TaskId::Writer(kind) => self.spawn_writer(rt, kind, delay),
        }
        self.publish(rt);
    }

    fn publish(&self, rt: &mut Runtime) {
        // Tasks whose restart delay has elapsed are running again.
        for spawned in rt.spawned.values() {
            if spawned.started.elapsed() < spawned.delay {
                continue;
            }
            if let Some(status) = rt
                .status
                .tasks
                .get_mut(&spawned.task.to_string())
                .filter(|status| status.state == TaskState::Restarting)
            {
                status.state = TaskState::Running;
            }
        }

        if let Some(senders) = &rt.senders {
            for kind in RecordKind::ALL {
                let depth = senders.for_kind(kind).depth();
                metrics::set_queue_depth(kind, depth);
                let writer = rt
                    .writer_stats
                    .get(&kind)
                    .map(|s| s.snapshot())
                    .unwrap_or_default();
                rt.status.queues.insert(
                    kind.to_string(),
                    QueueStatus {
                        depth,
                        queue: rt.queues.stats(kind),
                        writer,
                    },
                );
            }
        }

        self.status_tx.send_replace(rt.status.clone());
    }

    async fn shutdown(&self, mut rt: Runtime) -> ShutdownReport {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        rt.status.phase = PipelinePhase::ShuttingDown;
        self.publish(&mut rt);
        tracing::info!(
            timeout_secs = self.config.shutdown_timeout.as_secs(),
            "Pipeline shutting down"
        );

        let mut forced = Vec::new();

        rt.collector_cancel.cancel();
        forced.extend(await_until(&mut rt.collectors, &mut rt.spawned, deadline).await);

        // Writers see their queues close once the last sender is gone.
        rt.senders = None;
        rt.writer_cancel.cancel();
        forced.extend(await_until(&mut rt.writers, &mut rt.spawned, deadline).await);

        for task in &forced {
            tracing::error!(task = %task, "Task missed shutdown deadline, aborted");
        }
        for kind in RecordKind::ALL {
            rt.abandon_writer_batch(kind);
        }

        self.storage.close_all().await;
        self.source.close().await;

        for status in rt.status.tasks.values_mut() {
            status.state = TaskState::Stopped;
        }
        rt.status.phase = PipelinePhase::Stopped;
        self.status_tx.send_replace(rt.status.clone());

        let report = ShutdownReport {
            forced,
            restarts: rt.status.total_restarts,
        };
        tracing::info!(
            forced = report.forced.len(),
            restarts = report.restarts,
            "Pipeline stopped"
        );
        report
    }
}

// =============================================================================
// Task Helpers
// =============================================================================

/// Why a task ended.
#[derive(Debug)]
enum TaskOutcome {
    Returned,
    Failed(String),
    Panicked(String),
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Returned => f.write_str("returned unexpectedly"),
            Self::Failed(e) => f.write_str(e),
            Self::Panicked(e) => write!(f, "panicked: {e}"),
        }
    }
}

fn collector_outcome(
    joined: Result<(JoinId, Result<(), CollectorError>), JoinError>,
) -> (JoinId, TaskOutcome) {
    match joined {
        Ok((id, Ok(()))) => (id, TaskOutcome::Returned),
        Ok((id, Err(e))) => (id, TaskOutcome::Failed(e.to_string())),
        Err(e) => (e.id(), join_error_outcome(e)),
    }
}

fn writer_outcome(joined: Result<(JoinId, ()), JoinError>) -> (JoinId, TaskOutcome) {
    match joined {
        Ok((id, ())) => (id, TaskOutcome::Returned),
        Err(e) => (e.id(), join_error_outcome(e)),
    }
}

fn join_error_outcome(err: JoinError) -> TaskOutcome {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        TaskOutcome::Panicked(message)
    } else {
        TaskOutcome::Failed("task cancelled".to_string())
    }
}

/// Sleep out a restart delay; returns `false` if cancelled first.
async fn wait_restart_delay(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Await every task in the set until the deadline, then abort the rest.
/// Returns the tasks that had to be aborted.
async fn await_until<T: 'static>(
    set: &mut JoinSet<T>,
    spawned: &mut HashMap<JoinId, Spawned>,
    deadline: Instant,
) -> Vec<TaskId> {
    loop {
        match tokio::time::timeout_at(deadline, set.join_next_with_id()).await {
            Ok(Some(Ok((id, _)))) => {
                spawned.remove(&id);
            }
            Ok(Some(Err(e))) => {
                if e.is_panic() {
                    tracing::error!(task_id = %e.id(), "Task panicked during shutdown");
                }
                spawned.remove(&e.id());
            }
            Ok(None) => return Vec::new(),
            Err(_) => break,
        }
    }

    set.abort_all();
    let mut forced = Vec::new();
    while let Some(joined) = set.join_next_with_id().await {
        let id = match joined {
            Ok((id, _)) => id,
            Err(e) => e.id(),
        };
        if let Some(entry) = spawned.remove(&id) {
            forced.push(entry.task);
        }
    }
    forced
}
