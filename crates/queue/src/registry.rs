//! Queue registry: one backend connection, named queues, their workers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{BackendError, QueueBackend};
use crate::job::{JobHandler, QueueJob};
use crate::queue::Queue;
use crate::types::JobOptions;
use crate::worker::{Worker, WorkerHandle, WorkerOptions};

/// Static configuration of one named queue.
#[derive(Debug, Clone)]
pub struct QueueDefinition {
    pub name: &'static str,
    /// Options every job added through [`Queue`] starts from.
    pub defaults: JobOptions,
    pub worker: WorkerOptions,
}

impl QueueDefinition {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            defaults: JobOptions::default(),
            worker: WorkerOptions::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.worker = self.worker.with_concurrency(concurrency);
        self
    }

    pub fn with_worker(mut self, worker: WorkerOptions) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_defaults(mut self, defaults: JobOptions) -> Self {
        self.defaults = defaults;
        self
    }
}

type SpawnFn = Arc<dyn Fn(CancellationToken) -> WorkerHandle + Send + Sync>;

struct WorkerSlot {
    handle: WorkerHandle,
    spawn: SpawnFn,
}

/// Liveness of one registered worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub queue: &'static str,
    pub running: bool,
}

/// Owns the backend connection, queue definitions and workers.
///
/// Constructed once at boot and passed (behind an `Arc`) to everything that
/// produces jobs or supervises workers.
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    definitions: Mutex<BTreeMap<&'static str, QueueDefinition>>,
    workers: Mutex<BTreeMap<&'static str, WorkerSlot>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &self.queue_names())
            .field("shutting_down", &self.cancel.is_cancelled())
            .finish()
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QueueManager {
    /// Verify the backend is reachable and build the manager.
    ///
    /// An unreachable backend at boot is an error the caller should treat as fatal.
    pub async fn connect(backend: Arc<dyn QueueBackend>) -> Result<Self, BackendError> {
        backend.ping().await?;
        info!("queue backend connected");
        Ok(Self {
            backend,
            definitions: Mutex::new(BTreeMap::new()),
            workers: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    /// Register (or replace) a queue definition.
    pub fn define(&self, definition: QueueDefinition) {
        info!(
            queue = definition.name,
            concurrency = definition.worker.concurrency,
            attempts = definition.defaults.attempts,
            "queue defined"
        );
        guard(&self.definitions).insert(definition.name, definition);
    }

    pub fn definition(&self, queue: &str) -> Option<QueueDefinition> {
        guard(&self.definitions).get(queue).cloned()
    }

    pub fn queue_names(&self) -> Vec<&'static str> {
        guard(&self.definitions).keys().copied().collect()
    }

    /// Typed producer for `J`'s queue.
    pub fn queue<J: QueueJob>(&self) -> Queue<J> {
        let defaults = self
            .definition(J::QUEUE)
            .map(|d| d.defaults)
            .unwrap_or_default();
        Queue::new(self.backend.clone(), defaults)
    }

    /// Start the worker for `J`'s queue. Does nothing if one is already running
    /// or the manager is shutting down. Returns whether a worker was started.
    pub fn start_worker<J, H>(&self, handler: Arc<H>) -> bool
    where
        J: QueueJob,
        H: JobHandler<J>,
    {
        if self.cancel.is_cancelled() {
            warn!(queue = J::QUEUE, "not starting worker during shutdown");
            return false;
        }

        let mut workers = guard(&self.workers);
        if workers.get(J::QUEUE).is_some_and(|slot| slot.handle.is_running()) {
            return false;
        }

        let opts = match self.definition(J::QUEUE) {
            Some(def) => def.worker,
            None => {
                warn!(queue = J::QUEUE, "starting worker for undefined queue with default options");
                WorkerOptions::default()
            }
        };

        let backend = self.backend.clone();
        let spawn: SpawnFn = Arc::new(move |cancel| {
            Worker::<J, H>::new(backend.clone(), handler.clone(), opts.clone()).spawn(cancel)
        });
        let handle = spawn(self.cancel.child_token());
        workers.insert(J::QUEUE, WorkerSlot { handle, spawn });
        true
    }

    pub fn worker_status(&self) -> Vec<WorkerStatus> {
        guard(&self.workers)
            .values()
            .map(|slot| WorkerStatus {
                queue: slot.handle.queue(),
                running: slot.handle.is_running(),
            })
            .collect()
    }

    /// Stop one worker without unregistering it; the next heartbeat restarts it.
    pub fn stop_worker(&self, queue: &str) -> bool {
        match guard(&self.workers).get(queue) {
            Some(slot) => {
                slot.handle.stop();
                true
            }
            None => false,
        }
    }

    /// Respawn every registered worker whose loop has exited. Returns the queues restarted.
    pub fn restart_dead_workers(&self) -> Vec<&'static str> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }

        let mut restarted = Vec::new();
        for (queue, slot) in guard(&self.workers).iter_mut() {
            if slot.handle.is_running() {
                continue;
            }
            warn!(queue = *queue, "worker not running; restarting");
            slot.handle = (slot.spawn)(self.cancel.child_token());
            restarted.push(*queue);
        }
        restarted
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop all workers and wait up to `timeout` for each to drain.
    /// Returns how many had to be aborted.
    pub async fn shutdown_workers(&self, timeout: Duration) -> usize {
        self.cancel.cancel();
        let slots: Vec<WorkerSlot> = std::mem::take(&mut *guard(&self.workers)).into_values().collect();
        info!(workers = slots.len(), "stopping workers");

        let results = join_all(slots.into_iter().map(|slot| slot.handle.shutdown(timeout))).await;
        let aborted = results.iter().filter(|drained| !**drained).count();
        if aborted > 0 {
            error!(aborted, "workers force-closed during shutdown");
        }
        aborted
    }
}
