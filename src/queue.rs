//! Per-model task queue.
//!
//! Unbounded FIFO of shared tasks with a non-blocking push, a bounded-wait
//! pop, and a batched pop that separates deadline-expired tasks from the
//! ones worth forwarding to the GPU. Consumers are compute threads, so
//! waiting uses a condvar rather than an async notifier.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::task::Task;

/// Result of a batched dequeue: tasks to run and tasks past their deadline.
pub struct DequeuedBatch {
    pub ready: Vec<Arc<Task>>,
    pub expired: Vec<Arc<Task>>,
}

/// Unbounded FIFO of pending inference tasks.
pub struct BatchQueue {
    queue: Mutex<VecDeque<Arc<Task>>>,
    available: Condvar,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Non-blocking push.
    pub fn push(&self, task: Arc<Task>) {
        self.queue.lock().push_back(task);
        self.available.notify_one();
    }

    /// Pop the front task, waiting up to `timeout` for one to arrive.
    pub fn pop_wait(&self, timeout: Duration) -> Option<Arc<Task>> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.available.wait_for(&mut queue, timeout);
        }
        queue.pop_front()
    }

    /// Pop up to `max` tasks ready to run at `now`.
    ///
    /// Tasks whose deadline has passed are popped into `expired` and do not
    /// count against `max`; they must never reach the GPU.
    pub fn pop_batch(&self, max: usize, now: Instant) -> DequeuedBatch {
        let mut queue = self.queue.lock();
        let mut ready = Vec::new();
        let mut expired = Vec::new();
        while ready.len() < max {
            let Some(task) = queue.pop_front() else { break };
            if task.expired(now) {
                expired.push(task);
            } else {
                ready.push(task);
            }
        }
        DequeuedBatch { ready, expired }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Wake a waiting consumer (used during shutdown).
    pub fn wake(&self) {
        self.available.notify_all();
    }
}

impl Default for BatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ModelSession;
    use crate::telemetry::Gauge;
    use crate::wire::QueryProto;
    use tokio::sync::mpsc;

    fn task_with_sla(query_id: u64, sla_ms: u32) -> Arc<Task> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = ModelSession::new("tensorflow", "resnet50", 1, sla_ms);
        let query = QueryProto {
            query_id,
            model_session_id: session.id(),
            input: vec![0; 8],
            window: Vec::new(),
        };
        // Keep the receiver alive inside the task's channel: dropped rx is
        // fine here, dispatch errors are ignored by design.
        Task::new(query, session, false, tx, Arc::new(Gauge::new()))
    }

    #[test]
    fn fifo_order_preserved() {
        let queue = BatchQueue::new();
        for id in 0..4 {
            queue.push(task_with_sla(id, 1000));
        }
        let batch = queue.pop_batch(4, Instant::now());
        let ids: Vec<u64> = batch.ready.iter().map(|t| t.query.query_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(batch.expired.is_empty());
    }

    #[test]
    fn batch_respects_max() {
        let queue = BatchQueue::new();
        for id in 0..5 {
            queue.push(task_with_sla(id, 1000));
        }
        let batch = queue.pop_batch(3, Instant::now());
        assert_eq!(batch.ready.len(), 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn expired_tasks_separated_and_do_not_count() {
        let queue = BatchQueue::new();
        queue.push(task_with_sla(0, 0)); // deadline == arrival
        queue.push(task_with_sla(1, 1000));
        queue.push(task_with_sla(2, 1000));

        let batch = queue.pop_batch(2, Instant::now());
        assert_eq!(batch.expired.len(), 1);
        assert_eq!(batch.expired[0].query.query_id, 0);
        assert_eq!(batch.ready.len(), 2);
    }

    #[test]
    fn pop_wait_times_out_on_empty() {
        let queue = BatchQueue::new();
        let got = queue.pop_wait(Duration::from_millis(10));
        assert!(got.is_none());
    }
}
