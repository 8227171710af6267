//! Pre/postprocess worker pool.
//!
//! A fixed pool of compute threads fed by the GPU driver thread. Workers
//! pull from one shared job queue, distinct from the per-model task
//! queues. Preprocess handoffs use a `Latch` so the driver can wait for a
//! whole batch before launching the forward pass; postprocess jobs are
//! fire-and-forget.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A unit of work handed to the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// Fixed-size pool of pre/postprocess workers.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `num_workers` threads. When `cores` is non-empty, workers are
    /// pinned round-robin onto those cores (advisory).
    pub fn new(num_workers: usize, cores: &[usize]) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let shared = shared.clone();
            let core = (!cores.is_empty()).then(|| cores[i % cores.len()]);
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    if let Some(id) = core {
                        core_affinity::set_for_current(core_affinity::CoreId { id });
                    }
                    worker_loop(&shared);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { shared, handles: Mutex::new(handles) }
    }

    pub fn execute(&self, job: Job) {
        self.shared.queue.lock().push_back(job);
        self.shared.available.notify_one();
    }

    pub fn num_workers(&self) -> usize {
        self.handles.lock().len()
    }

    /// Signal shutdown and join every worker. Queued jobs are drained
    /// before the threads exit.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                shared
                    .available
                    .wait_for(&mut queue, Duration::from_millis(100));
            }
        };
        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

/// Count-down barrier for waiting on a batch of jobs.
pub struct Latch {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self { remaining: Mutex::new(count), done: Condvar::new() })
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.done.wait(&mut remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn executes_submitted_jobs() {
        let pool = WorkerPool::new(2, &[]);
        let counter = Arc::new(AtomicUsize::new(0));
        let latch = Latch::new(8);
        for _ in 0..8 {
            let counter = counter.clone();
            let latch = latch.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                latch.count_down();
            }));
        }
        latch.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        pool.stop();
    }

    #[test]
    fn stop_drains_queued_jobs() {
        let pool = WorkerPool::new(1, &[]);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn latch_with_zero_count_does_not_block() {
        let latch = Latch::new(0);
        latch.wait();
    }
}
