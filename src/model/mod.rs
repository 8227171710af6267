//! Model runners.
//!
//! A `ModelRunner` is the batched-forward capability behind one resident
//! model executor. Three variants exist: a plain single-session network, a
//! shared-prefix family, and a `tf_share` trunk with suffix heads. The
//! reconciliation code pattern-matches the variant instead of downcasting.

use std::sync::Arc;

use thiserror::Error;

pub mod database;
pub mod network;

mod plain;
mod share_prefix;
mod tf_share;

pub use database::{DatabaseError, ModelDatabase, ModelEntry, ModelProfile};
pub use network::Network;
pub use plain::PlainModel;
pub use share_prefix::SharePrefixModel;
pub use tf_share::TfShareModel;

use crate::session::ModelSession;
use crate::task::{Task, TensorInput};
use crate::wire::OutputProto;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model {0} not found in the model database")]
    MissingEntry(String),

    #[error("suffix model {model} is not declared by trunk {trunk}")]
    SuffixNotDeclared { trunk: String, model: String },

    #[error("{0} is not a composite model")]
    NotComposite(&'static str),

    #[error("session {0} is not bound to this model")]
    UnknownSession(String),

    #[error("query input is empty")]
    EmptyInput,

    #[error("batch shape mismatch: expected {expected} values, got {got}")]
    BatchShape { expected: usize, got: usize },
}

/// Runner variant tag, exposed for reconciliation and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Plain,
    SharePrefix,
    TfShare,
}

/// A dense batch assembled from preprocessed tasks.
pub struct BatchInput {
    pub data: Vec<f32>,
    pub batch: usize,
    /// Session id per batch item, used by composite runners for slicing.
    pub session_ids: Vec<String>,
}

/// Per-item outputs of one forward pass.
pub struct BatchOutput {
    pub outputs: Vec<Vec<f32>>,
}

/// Decode an opaque query input into a dense tensor of `input_size` floats.
fn decode_input(bytes: &[u8], input_size: usize) -> Result<TensorInput, ModelError> {
    if bytes.is_empty() {
        return Err(ModelError::EmptyInput);
    }
    let data = (0..input_size)
        .map(|i| f32::from(bytes[i % bytes.len()]) / 255.0)
        .collect();
    Ok(TensorInput { data })
}

/// Polymorphic model runner.
pub enum ModelRunner {
    Plain(PlainModel),
    SharePrefix(SharePrefixModel),
    TfShare(TfShareModel),
}

impl ModelRunner {
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Plain(_) => ModelKind::Plain,
            Self::SharePrefix(_) => ModelKind::SharePrefix,
            Self::TfShare(_) => ModelKind::TfShare,
        }
    }

    pub fn input_size(&self) -> usize {
        match self {
            Self::Plain(m) => m.input_size(),
            Self::SharePrefix(m) => m.input_size(),
            Self::TfShare(m) => m.input_size(),
        }
    }

    /// Per-item forward latency from the database profile, used for
    /// duty-cycle budgeting.
    pub fn forward_latency_us(&self) -> u64 {
        match self {
            Self::Plain(m) => m.forward_latency_us(),
            Self::SharePrefix(m) => m.forward_latency_us(),
            Self::TfShare(m) => m.forward_latency_us(),
        }
    }

    /// Decode the task's query input into the model's tensor shape.
    pub fn preprocess(&self, task: &Task) -> Result<TensorInput, ModelError> {
        decode_input(&task.query.input, self.input_size())
    }

    /// Run one batched forward pass.
    pub fn forward(&self, input: &BatchInput) -> Result<BatchOutput, ModelError> {
        let expected = input.batch * self.input_size();
        if input.data.len() != expected {
            return Err(ModelError::BatchShape { expected, got: input.data.len() });
        }
        match self {
            Self::Plain(m) => m.forward(input),
            Self::SharePrefix(m) => m.forward(input),
            Self::TfShare(m) => m.forward(input),
        }
    }

    /// Finalize a task whose output slice has been attached and dispatch
    /// the reply.
    pub fn postprocess(&self, task: &Task) {
        task.complete_ok();
    }

    /// Attach one forward output slice to its task.
    pub fn attach_output(&self, task: &Task, data: Vec<f32>) {
        task.push_output(OutputProto { name: "output".to_string(), data });
    }

    /// Bound session ids. A plain runner has exactly one.
    pub fn session_ids(&self) -> Vec<String> {
        match self {
            Self::Plain(m) => vec![m.session_id().to_string()],
            Self::SharePrefix(m) => m.session_ids(),
            Self::TfShare(m) => m.session_ids(),
        }
    }

    pub fn num_model_sessions(&self) -> usize {
        match self {
            Self::Plain(_) => 1,
            Self::SharePrefix(m) => m.num_model_sessions(),
            Self::TfShare(m) => m.num_model_sessions(),
        }
    }

    pub fn has_model_session(&self, session_id: &str) -> bool {
        match self {
            Self::Plain(m) => m.session_id() == session_id,
            Self::SharePrefix(m) => m.has_model_session(session_id),
            Self::TfShare(m) => m.has_model_session(session_id),
        }
    }

    /// Bind a session to a composite runner. Returns true when newly
    /// inserted, false when already present.
    pub fn add_model_session(&mut self, session: &ModelSession) -> Result<bool, ModelError> {
        match self {
            Self::Plain(_) => Err(ModelError::NotComposite("plain model")),
            Self::SharePrefix(m) => m.add_model_session(session),
            Self::TfShare(m) => m.add_model_session(session),
        }
    }

    /// Unbind a session from a composite runner. Returns true when found.
    pub fn remove_model_session(&mut self, session_id: &str) -> Result<bool, ModelError> {
        match self {
            Self::Plain(_) => Err(ModelError::NotComposite("plain model")),
            Self::SharePrefix(m) => Ok(m.remove_model_session(session_id)),
            Self::TfShare(m) => Ok(m.remove_model_session(session_id)),
        }
    }
}

/// Shared handle to the model database, held by composite runners so that
/// later-bound sessions can be loaded.
pub type SharedDatabase = Arc<ModelDatabase>;
