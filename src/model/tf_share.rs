//! `tf_share` trunk model runner.
//!
//! One pre-trained trunk exposing multiple suffix heads. The set of bound
//! sessions is always a subset of {trunk} ∪ declared suffix heads; heads
//! are per-session, the trunk is shared by all of them.

use std::collections::HashMap;

use super::database::ModelEntry;
use super::network::Network;
use super::{BatchInput, BatchOutput, ModelError, SharedDatabase};
use crate::session::ModelSession;

/// A shared trunk with per-session suffix heads.
pub struct TfShareModel {
    trunk_entry: ModelEntry,
    trunk: Network,
    heads: HashMap<String, Network>,
}

impl TfShareModel {
    /// Load a trunk and bind `sessions`. The first session names the trunk;
    /// every other session must be a declared suffix head.
    pub fn load(db: &SharedDatabase, sessions: &[ModelSession]) -> Result<Self, ModelError> {
        let first = sessions
            .first()
            .ok_or(ModelError::NotComposite("empty session list"))?;
        let trunk_entry = db
            .tf_share_info(&first.model_name)
            .ok_or_else(|| ModelError::MissingEntry(first.model_name.clone()))?
            .clone();

        let mut model = Self {
            trunk: Network::trunk_from_entry(&trunk_entry),
            trunk_entry,
            heads: HashMap::new(),
        };
        for session in sessions {
            model.add_model_session(session)?;
        }
        Ok(model)
    }

    pub fn trunk_name(&self) -> &str {
        &self.trunk_entry.model_name
    }

    pub fn input_size(&self) -> usize {
        self.trunk.input_size()
    }

    pub fn forward_latency_us(&self) -> u64 {
        self.trunk_entry.profile.forward_latency_us
    }

    pub fn num_model_sessions(&self) -> usize {
        self.heads.len()
    }

    pub fn has_model_session(&self, session_id: &str) -> bool {
        self.heads.contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.heads.keys().cloned().collect()
    }

    /// Bind a session. Returns true when newly inserted. The session must
    /// name the trunk itself or one of its declared suffix heads.
    pub fn add_model_session(&mut self, session: &ModelSession) -> Result<bool, ModelError> {
        let name = &session.model_name;
        if *name != self.trunk_entry.model_name && !self.trunk_entry.suffix_models.contains(name) {
            return Err(ModelError::SuffixNotDeclared {
                trunk: self.trunk_entry.model_name.clone(),
                model: name.clone(),
            });
        }
        let session_id = session.id();
        if self.heads.contains_key(&session_id) {
            return Ok(false);
        }
        self.heads
            .insert(session_id, Network::head_from_entry(&self.trunk_entry, name));
        Ok(true)
    }

    /// Unbind a session. Returns true when it was bound.
    pub fn remove_model_session(&mut self, session_id: &str) -> bool {
        self.heads.remove(session_id).is_some()
    }

    pub fn forward(&self, input: &BatchInput) -> Result<BatchOutput, ModelError> {
        // Trunk once over the whole batch, then each item's head.
        let shared = self.trunk.forward(&input.data, input.batch);
        let width = self.trunk.output_size();
        let mut outputs = Vec::with_capacity(input.batch);
        for (i, session_id) in input.session_ids.iter().enumerate() {
            let head = self
                .heads
                .get(session_id)
                .ok_or_else(|| ModelError::UnknownSession(session_id.clone()))?;
            let slice = &shared[i * width..(i + 1) * width];
            outputs.push(head.forward(slice, 1));
        }
        Ok(BatchOutput { outputs })
    }
}
