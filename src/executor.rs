//! Model executor: a resident model instance.
//!
//! Wraps one `ModelRunner` with its task queue, the scheduler-assigned
//! batch size, the backup-backend set used for overload relay, and the
//! request/drop rate meters the heartbeat reports. Executors are owned by
//! the model table and shared weakly with the GPU executor while resident.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::ctrl::ModelInstanceConfig;
use crate::model::{ModelKind, ModelRunner};
use crate::queue::{BatchQueue, DequeuedBatch};
use crate::task::Task;
use crate::telemetry::RateMeter;
use crate::wire::QueryStatus;

/// Queue-length multiple of the batch size beyond which relay kicks in.
const RELAY_QUEUE_FACTOR: u32 = 2;

/// A model instance resident on this node.
pub struct ModelExecutor {
    runner: RwLock<ModelRunner>,
    queue: BatchQueue,
    batch: AtomicU32,
    backup_backends: Mutex<Vec<u32>>,
    backup_cursor: AtomicUsize,
    request_meter: RateMeter,
    drop_meter: RateMeter,
}

impl ModelExecutor {
    pub fn new(runner: ModelRunner, batch: u32) -> Arc<Self> {
        Arc::new(Self {
            runner: RwLock::new(runner),
            queue: BatchQueue::new(),
            batch: AtomicU32::new(batch.max(1)),
            backup_backends: Mutex::new(Vec::new()),
            backup_cursor: AtomicUsize::new(0),
            request_meter: RateMeter::new(),
            drop_meter: RateMeter::new(),
        })
    }

    pub fn kind(&self) -> ModelKind {
        self.runner.read().kind()
    }

    pub fn batch(&self) -> u32 {
        self.batch.load(Ordering::SeqCst)
    }

    /// Idempotent; takes effect at the next batch dequeue.
    pub fn set_batch(&self, batch: u32) {
        self.batch.store(batch.max(1), Ordering::SeqCst);
    }

    /// Replace the backup set atomically. In-flight relays are unaffected.
    pub fn update_backup_backends(&self, config: &ModelInstanceConfig) {
        let ids: Vec<u32> = config.backup_backends.iter().map(|b| b.node_id).collect();
        *self.backup_backends.lock() = ids;
    }

    pub fn backup_backends(&self) -> Vec<u32> {
        self.backup_backends.lock().clone()
    }

    /// Round-robin choice among the configured backups.
    pub fn next_backup(&self) -> Option<u32> {
        let backups = self.backup_backends.lock();
        if backups.is_empty() {
            return None;
        }
        let i = self.backup_cursor.fetch_add(1, Ordering::Relaxed) % backups.len();
        Some(backups[i])
    }

    /// Enqueue a task, recording arrival for the request-rate meter.
    pub fn add_task(&self, task: Arc<Task>) {
        self.request_meter.record(Instant::now());
        self.queue.push(task);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Overload test for the relay path: the queue has grown past
    /// `batch × RELAY_QUEUE_FACTOR`, or the work already queued cannot
    /// finish before this task's deadline.
    pub fn should_relay(&self, task: &Task) -> bool {
        let queued = self.queue.len() as u64;
        if queued > u64::from(self.batch() * RELAY_QUEUE_FACTOR) {
            return true;
        }
        let predicted = Duration::from_micros(queued * self.forward_latency_us());
        Instant::now() + predicted >= task.deadline
    }

    /// Dequeue up to the current batch size. Expired tasks are completed
    /// with `Timeout`, counted as drops, and never forwarded.
    pub fn dequeue_batch(&self, now: Instant) -> DequeuedBatch {
        let batch = self.queue.pop_batch(self.batch() as usize, now);
        for task in &batch.expired {
            self.drop_meter.record(now);
            task.complete_error(QueryStatus::Timeout, "deadline passed before execution");
        }
        batch
    }

    pub fn get_request_rate(&self) -> f64 {
        self.request_meter.rate(Instant::now())
    }

    pub fn get_drop_rate(&self) -> f64 {
        self.drop_meter.rate(Instant::now())
    }

    /// Per-item forward latency for duty-cycle budgeting.
    pub fn forward_latency_us(&self) -> u64 {
        self.runner.read().forward_latency_us()
    }

    /// Shared read access to the runner (forward path).
    pub fn runner(&self) -> parking_lot::RwLockReadGuard<'_, ModelRunner> {
        self.runner.read()
    }

    /// Exclusive access to the runner (reconciliation path).
    pub fn runner_mut(&self) -> parking_lot::RwLockWriteGuard<'_, ModelRunner> {
        self.runner.write()
    }

    /// Wake any consumer blocked on this executor's queue.
    pub fn wake(&self) {
        self.queue.wake();
    }
}
