//! GPU executor.
//!
//! Owns the GPU: a single driver thread serves every resident model
//! executor, one batched forward at a time. In `MultiBatching` mode each
//! iteration divides the scheduler-assigned duty cycle among residents in
//! proportion to batch size × per-item forward latency and sleeps out any
//! unused remainder; `NoMultiBatching` drains residents round-robin with
//! no pacing. Preprocess and postprocess run on the worker pool; the
//! forward pass itself never leaves the driver thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::executor::ModelExecutor;
use crate::model::BatchInput;
use crate::task::Task;
use crate::telemetry::Gauge;
use crate::wire::QueryStatus;
use crate::worker::{Latch, WorkerPool};

/// Idle sleep when no model has work (and no duty cycle is set).
const IDLE_SLEEP: Duration = Duration::from_millis(2);

/// Scheduling mode, selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuMode {
    MultiBatching,
    NoMultiBatching,
}

struct Inner {
    mode: GpuMode,
    gpu_id: u32,
    running: AtomicBool,
    duty_cycle_us: AtomicU64,
    /// Resident executors, weakly referenced: the model table owns them.
    /// The driver snapshots this list once per iteration, so membership
    /// changes take effect at iteration boundaries only.
    models: Mutex<Vec<Weak<ModelExecutor>>>,
    occupancy: Arc<Gauge>,
    workers: Arc<WorkerPool>,
}

/// Duty-cycle-bounded executor for all models resident on one GPU.
pub struct GpuExecutor {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GpuExecutor {
    pub fn new(
        mode: GpuMode,
        gpu_id: u32,
        workers: Arc<WorkerPool>,
        occupancy: Arc<Gauge>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                gpu_id,
                running: AtomicBool::new(false),
                duty_cycle_us: AtomicU64::new(0),
                models: Mutex::new(Vec::new()),
                occupancy,
                workers,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Make an executor resident. Takes effect at the next iteration.
    pub fn add_model(&self, model: &Arc<ModelExecutor>) {
        let mut models = self.inner.models.lock();
        if !models.iter().any(|w| w.ptr_eq(&Arc::downgrade(model))) {
            models.push(Arc::downgrade(model));
        }
    }

    /// Remove an executor from the resident set. The in-flight iteration
    /// is never interrupted; its queue is woken so blocked consumers see
    /// the removal.
    pub fn remove_model(&self, model: &Arc<ModelExecutor>) {
        let target = Arc::downgrade(model);
        self.inner.models.lock().retain(|w| !w.ptr_eq(&target));
        model.wake();
    }

    pub fn set_duty_cycle(&self, duty_cycle_us: u64) {
        self.inner.duty_cycle_us.store(duty_cycle_us, Ordering::SeqCst);
    }

    pub fn duty_cycle_us(&self) -> u64 {
        self.inner.duty_cycle_us.load(Ordering::SeqCst)
    }

    /// Live resident executors (dead weak refs pruned).
    pub fn resident_count(&self) -> usize {
        let mut models = self.inner.models.lock();
        models.retain(|w| w.strong_count() > 0);
        models.len()
    }

    /// Busy share of the last duty cycle, 1.0 = saturated.
    pub fn occupancy(&self) -> f64 {
        self.inner.occupancy.get()
    }

    /// Spawn the driver thread, optionally pinned to `core`.
    pub fn start(&self, core: Option<usize>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("gpu-driver".to_string())
            .spawn(move || {
                if let Some(id) = core {
                    if core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        info!(core = id, "gpu driver pinned");
                    }
                }
                info!(gpu_id = inner.gpu_id, mode = ?inner.mode, "gpu driver started");
                driver_loop(&inner);
                info!(gpu_id = inner.gpu_id, "gpu driver stopped");
            })
            .expect("failed to spawn gpu driver thread");
        *handle = Some(spawned);
    }

    /// Stop the driver. The current iteration drains before the join.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GpuExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn driver_loop(inner: &Inner) {
    while inner.running.load(Ordering::SeqCst) {
        let models = snapshot(inner);
        match inner.mode {
            GpuMode::MultiBatching => multi_batching_iteration(inner, &models),
            GpuMode::NoMultiBatching => round_robin_iteration(inner, &models),
        }
    }
}

fn snapshot(inner: &Inner) -> Vec<Arc<ModelExecutor>> {
    let mut models = inner.models.lock();
    models.retain(|w| w.strong_count() > 0);
    models.iter().filter_map(Weak::upgrade).collect()
}

/// One duty-cycle pass: serve every resident model its share, then sleep
/// out the remainder.
fn multi_batching_iteration(inner: &Inner, models: &[Arc<ModelExecutor>]) {
    let duty_us = inner.duty_cycle_us.load(Ordering::SeqCst);
    if models.is_empty() {
        inner.occupancy.set(0.0);
        thread::sleep(if duty_us > 0 {
            Duration::from_micros(duty_us)
        } else {
            IDLE_SLEEP
        });
        return;
    }

    let start = Instant::now();
    let total_weight: u64 = models
        .iter()
        .map(|m| u64::from(m.batch()) * m.forward_latency_us())
        .sum();

    for model in models {
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        let weight = u64::from(model.batch()) * model.forward_latency_us();
        if duty_us > 0 && total_weight > 0 {
            let share_us = duty_us * weight / total_weight;
            debug!(share_us, batch = model.batch(), "duty-cycle share");
        }
        serve_model(inner, model);
    }

    let busy = start.elapsed();
    if duty_us > 0 {
        inner
            .occupancy
            .set(busy.as_micros() as f64 / duty_us as f64);
        let duty = Duration::from_micros(duty_us);
        if busy < duty {
            thread::sleep(duty - busy);
        }
    } else {
        inner.occupancy.set(0.0);
        thread::sleep(IDLE_SLEEP);
    }
}

/// Unpaced pass: drain each model up to its batch size before yielding.
fn round_robin_iteration(inner: &Inner, models: &[Arc<ModelExecutor>]) {
    let mut served = 0;
    for model in models {
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        served += serve_model(inner, model);
    }
    if served == 0 {
        thread::sleep(IDLE_SLEEP);
    }
}

/// Dequeue one batch for `model`, run the three pipeline stages, and
/// dispatch replies. Returns the number of tasks forwarded.
fn serve_model(inner: &Inner, model: &Arc<ModelExecutor>) -> usize {
    let batch = model.dequeue_batch(Instant::now());
    if batch.ready.is_empty() {
        return 0;
    }

    // Preprocess on the worker pool; wait for the whole batch.
    let latch = Latch::new(batch.ready.len());
    for task in &batch.ready {
        let model = model.clone();
        let task = task.clone();
        let latch = latch.clone();
        inner.workers.execute(Box::new(move || {
            let result = model.runner().preprocess(&task);
            match result {
                Ok(tensor) => task.set_tensor(tensor),
                Err(e) => task.complete_error(QueryStatus::InputTypeIncorrect, e.to_string()),
            }
            latch.count_down();
        }));
    }
    latch.wait();

    // Assemble the dense batch from tasks that survived preprocess.
    let mut tasks: Vec<Arc<Task>> = Vec::with_capacity(batch.ready.len());
    let mut data = Vec::new();
    let mut session_ids = Vec::with_capacity(batch.ready.len());
    for task in batch.ready {
        if task.is_finished() {
            continue;
        }
        let Some(tensor) = task.take_tensor() else { continue };
        data.extend_from_slice(&tensor.data);
        session_ids.push(task.query.model_session_id.clone());
        tasks.push(task);
    }
    if tasks.is_empty() {
        return 0;
    }

    let input = BatchInput { data, batch: tasks.len(), session_ids };
    let output = {
        let runner = model.runner();
        runner.forward(&input)
    };

    match output {
        Ok(output) => {
            for (task, out) in tasks.iter().zip(output.outputs) {
                let model = model.clone();
                let task = task.clone();
                model.runner().attach_output(&task, out);
                inner.workers.execute(Box::new(move || {
                    model.runner().postprocess(&task);
                }));
            }
        }
        Err(e) => {
            // The whole batch fails; the model stays resident.
            warn!(gpu_id = inner.gpu_id, error = %e, "forward pass failed");
            for task in &tasks {
                task.complete_error(QueryStatus::ModelForwardError, e.to_string());
            }
        }
    }
    tasks.len()
}
