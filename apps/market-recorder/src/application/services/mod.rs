//! Application Services
//!
//! The long-running tasks of the ingestion pipeline and the queues that
//! connect them.
//!
//! - `Collector`: source events to storage records, with continuity audit
//! - `Writer`: batching and bounded-retry flushes, one per record kind
//! - `Supervisor`: task lifecycle, restart backoff, graceful shutdown

pub mod collector;
pub mod queue;
pub mod supervisor;
pub mod writer;

pub use collector::{Collector, CollectorConfig, CollectorError, TimestampGuard};
pub use queue::{
    EnqueueOutcome, QueueConfig, QueueSenders, QueueStats, QueueStatsSnapshot, RecordQueues,
    RecordReceiver, RecordSender, SharedReceiver,
};
pub use supervisor::{
    PipelinePhase, PipelineStatus, QueueStatus, RestartBackoff, RestartPolicy, ShutdownReport,
    StorageBackends, Supervisor, SupervisorConfig, TaskId, TaskState, TaskStatus,
};
pub use writer::{Writer, WriterConfig, WriterState, WriterStats, WriterStatsSnapshot};
