//! Durable job queues with leased workers.
//!
//! - [`backend`]: storage of job state (in-memory, Redis)
//! - [`job`]: typed job families and handlers
//! - [`worker`]: claim/run/settle loop with lease renewal
//! - [`registry`]: the [`QueueManager`] owning queues and workers
//! - [`heartbeat`], [`health`], [`repeatable`], [`supervisor`]: housekeeping

pub mod backend;
pub mod health;
pub mod heartbeat;
pub mod job;
pub mod queue;
pub mod registry;
pub mod repeatable;
pub mod supervisor;
pub mod types;
pub mod worker;

pub use backend::{BackendError, InMemoryBackend, QueueBackend};
#[cfg(feature = "redis")]
pub use backend::RedisBackend;
pub use health::{HealthConfig, HealthMonitor, HealthReport, QueueHealth};
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatReport};
pub use job::{JobContext, JobError, JobHandler, QueueJob};
pub use queue::Queue;
pub use registry::{QueueDefinition, QueueManager, WorkerStatus};
pub use repeatable::{RepeatableEntry, reconcile};
pub use supervisor::{ShutdownOutcome, Supervisor, SupervisorConfig};
pub use types::{
    BackoffPolicy, BackoffStrategy, JobCounts, JobId, JobOptions, JobRecord, JobState, RepeatSpec, RepeatableJob,
};
pub use worker::{WorkerHandle, WorkerOptions};
