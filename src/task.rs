//! Inference task lifecycle.
//!
//! A `Task` is created when a query arrives on a data-plane connection and
//! is reference-shared between that connection, the per-model queue, and
//! the output dispatch path. It carries the decoded query, the deadline
//! derived from the session's latency SLO, the tensor produced by
//! preprocess, and the reply sink the final result is dispatched through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::session::ModelSession;
use crate::telemetry::Gauge;
use crate::wire::{BackendMessage, OutputProto, QueryProto, QueryResultProto, QueryStatus};

/// Outbound half of the connection a reply is dispatched on.
pub type ReplyTx = mpsc::UnboundedSender<BackendMessage>;

/// Preprocessed model input for one task.
#[derive(Debug, Clone, Default)]
pub struct TensorInput {
    pub data: Vec<f32>,
}

#[derive(Default)]
struct TaskState {
    tensor: Option<TensorInput>,
    outputs: Vec<OutputProto>,
}

/// A single inference query in flight on this node.
pub struct Task {
    pub query: QueryProto,
    pub session: ModelSession,
    pub arrival: Instant,
    pub deadline: Instant,
    /// True when the query arrived as a peer relay; the reply then goes
    /// back as a relay reply carrying this node's occupancy.
    pub relayed: bool,
    reply_tx: ReplyTx,
    occupancy: Arc<Gauge>,
    state: Mutex<TaskState>,
    finished: AtomicBool,
}

impl Task {
    pub fn new(
        query: QueryProto,
        session: ModelSession,
        relayed: bool,
        reply_tx: ReplyTx,
        occupancy: Arc<Gauge>,
    ) -> Arc<Self> {
        let arrival = Instant::now();
        let deadline = arrival + std::time::Duration::from_millis(u64::from(session.latency_sla_ms));
        Arc::new(Self {
            query,
            session,
            arrival,
            deadline,
            relayed,
            reply_tx,
            occupancy,
            state: Mutex::new(TaskState::default()),
            finished: AtomicBool::new(false),
        })
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn set_tensor(&self, tensor: TensorInput) {
        self.state.lock().tensor = Some(tensor);
    }

    pub fn take_tensor(&self) -> Option<TensorInput> {
        self.state.lock().tensor.take()
    }

    pub fn push_output(&self, output: OutputProto) {
        self.state.lock().outputs.push(output);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Dispatch a successful reply with the accumulated outputs.
    /// A task completes at most once; later calls are ignored.
    pub fn complete_ok(&self) {
        let outputs = std::mem::take(&mut self.state.lock().outputs);
        self.dispatch(QueryResultProto {
            query_id: self.query.query_id,
            status: QueryStatus::Ok,
            outputs,
            error_message: String::new(),
            latency_us: self.arrival.elapsed().as_micros() as u64,
        });
    }

    /// Dispatch an error reply. A task completes at most once.
    pub fn complete_error(&self, status: QueryStatus, message: impl Into<String>) {
        let mut result = QueryResultProto::error(self.query.query_id, status, message);
        result.latency_us = self.arrival.elapsed().as_micros() as u64;
        self.dispatch(result);
    }

    /// Dispatch an already-built result (used for relay replies received
    /// from a backup backend).
    pub fn complete_with(&self, mut result: QueryResultProto) {
        result.query_id = self.query.query_id;
        self.dispatch(result);
    }

    fn dispatch(&self, result: QueryResultProto) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let message = if self.relayed {
            BackendMessage::RelayReply { result, occupancy: self.occupancy.get() }
        } else {
            BackendMessage::Reply(result)
        };
        // The connection may already be gone; nothing to do then.
        let _ = self.reply_tx.send(message);
    }
}
