//! Shared-prefix model runner.
//!
//! A family of networks sharing the first K layers at runtime. The prefix
//! runs once over the whole batch; each session's suffix then runs on its
//! corresponding slice. Binding or unbinding a session never touches the
//! prefix weights or the other sessions' slices.

use std::collections::HashMap;

use super::network::Network;
use super::{BatchInput, BatchOutput, ModelError, SharedDatabase};
use crate::session::ModelSession;

struct SuffixHead {
    network: Network,
    forward_latency_us: u64,
}

/// N sessions sharing an input-side prefix of layers.
pub struct SharePrefixModel {
    db: SharedDatabase,
    prefix: Network,
    prefix_length: u32,
    suffixes: HashMap<String, SuffixHead>,
}

impl SharePrefixModel {
    /// Load a prefix family bound to `sessions`. Every session needs a
    /// database entry; the first one defines the shared prefix.
    pub fn load(db: &SharedDatabase, sessions: &[ModelSession]) -> Result<Self, ModelError> {
        let first = sessions
            .first()
            .ok_or(ModelError::NotComposite("empty session list"))?;
        let lead = db
            .get(&first.model_name)
            .ok_or_else(|| ModelError::MissingEntry(first.model_name.clone()))?;

        let mut model = Self {
            db: db.clone(),
            prefix: Network::trunk_from_entry(lead),
            prefix_length: lead.prefix_length,
            suffixes: HashMap::new(),
        };
        for session in sessions {
            model.add_model_session(session)?;
        }
        Ok(model)
    }

    pub fn prefix_length(&self) -> u32 {
        self.prefix_length
    }

    pub fn input_size(&self) -> usize {
        self.prefix.input_size()
    }

    /// Budgeting latency: the slowest bound suffix.
    pub fn forward_latency_us(&self) -> u64 {
        self.suffixes
            .values()
            .map(|s| s.forward_latency_us)
            .max()
            .unwrap_or(0)
    }

    pub fn num_model_sessions(&self) -> usize {
        self.suffixes.len()
    }

    pub fn has_model_session(&self, session_id: &str) -> bool {
        self.suffixes.contains_key(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.suffixes.keys().cloned().collect()
    }

    pub fn add_model_session(&mut self, session: &ModelSession) -> Result<bool, ModelError> {
        let session_id = session.id();
        if self.suffixes.contains_key(&session_id) {
            return Ok(false);
        }
        let entry = self
            .db
            .get(&session.model_name)
            .ok_or_else(|| ModelError::MissingEntry(session.model_name.clone()))?;
        self.suffixes.insert(
            session_id,
            SuffixHead {
                network: Network::from_entry(entry),
                forward_latency_us: entry.profile.forward_latency_us,
            },
        );
        Ok(true)
    }

    pub fn remove_model_session(&mut self, session_id: &str) -> bool {
        self.suffixes.remove(session_id).is_some()
    }

    pub fn forward(&self, input: &BatchInput) -> Result<BatchOutput, ModelError> {
        // Single-session batch: one full pass, no slicing needed.
        if let [only] = input.session_ids.as_slice() {
            let suffix = self
                .suffixes
                .get(only)
                .ok_or_else(|| ModelError::UnknownSession(only.clone()))?;
            let shared = self.prefix.forward(&input.data, input.batch);
            let flat = suffix.network.forward(&shared, input.batch);
            let outputs = flat
                .chunks(suffix.network.output_size())
                .map(<[f32]>::to_vec)
                .collect();
            return Ok(BatchOutput { outputs });
        }

        // Shared prefix over the whole batch, then per-item suffix slices.
        let shared = self.prefix.forward(&input.data, input.batch);
        let width = self.prefix.output_size();
        let mut outputs = Vec::with_capacity(input.batch);
        for (i, session_id) in input.session_ids.iter().enumerate() {
            let suffix = self
                .suffixes
                .get(session_id)
                .ok_or_else(|| ModelError::UnknownSession(session_id.clone()))?;
            let slice = &shared[i * width..(i + 1) * width];
            outputs.push(suffix.network.forward(slice, 1));
        }
        Ok(BatchOutput { outputs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::database::{ModelDatabase, ModelEntry, ModelProfile};
    use std::sync::Arc;

    fn entry(name: &str, output: usize, latency: u64) -> ModelEntry {
        ModelEntry {
            framework: "tensorflow".into(),
            model_name: name.into(),
            profile: ModelProfile { input_size: 4, output_size: output, forward_latency_us: latency },
            prefix_length: 3,
            suffix_models: Default::default(),
        }
    }

    fn db() -> SharedDatabase {
        let mut db = ModelDatabase::new();
        db.insert(entry("vgg_face", 8, 2000));
        db.insert(entry("vgg_scene", 16, 2500));
        Arc::new(db)
    }

    fn sessions() -> Vec<ModelSession> {
        vec![
            ModelSession::new("tensorflow", "vgg_face", 1, 100),
            ModelSession::new("tensorflow", "vgg_scene", 1, 100),
        ]
    }

    #[test]
    fn load_binds_all_sessions() {
        let model = SharePrefixModel::load(&db(), &sessions()).unwrap();
        assert_eq!(model.num_model_sessions(), 2);
        for s in sessions() {
            assert!(model.has_model_session(&s.id()));
        }
        assert_eq!(model.prefix_length(), 3);
        assert_eq!(model.forward_latency_us(), 2500);
    }

    #[test]
    fn add_is_idempotent_remove_reports_presence() {
        let mut model = SharePrefixModel::load(&db(), &sessions()).unwrap();
        let face = sessions()[0].clone();
        assert!(!model.add_model_session(&face).unwrap());
        assert!(model.remove_model_session(&face.id()));
        assert!(!model.remove_model_session(&face.id()));
        assert_eq!(model.num_model_sessions(), 1);
    }

    #[test]
    fn removing_one_session_leaves_others_intact() {
        let sessions = sessions();
        let mut model = SharePrefixModel::load(&db(), &sessions).unwrap();
        let scene_id = sessions[1].id();

        let input = BatchInput {
            data: vec![0.5; 4],
            batch: 1,
            session_ids: vec![scene_id.clone()],
        };
        let before = model.forward(&input).unwrap();
        model.remove_model_session(&sessions[0].id());
        let after = model.forward(&input).unwrap();
        assert_eq!(before.outputs, after.outputs);
    }

    #[test]
    fn mixed_batch_slices_per_session() {
        let sessions = sessions();
        let model = SharePrefixModel::load(&db(), &sessions).unwrap();
        let input = BatchInput {
            data: vec![0.5; 8],
            batch: 2,
            session_ids: vec![sessions[0].id(), sessions[1].id()],
        };
        let out = model.forward(&input).unwrap();
        assert_eq!(out.outputs.len(), 2);
        assert_eq!(out.outputs[0].len(), 8);
        assert_eq!(out.outputs[1].len(), 16);
    }

    #[test]
    fn unknown_session_in_batch_is_an_error() {
        let model = SharePrefixModel::load(&db(), &sessions()).unwrap();
        let input = BatchInput {
            data: vec![0.5; 4],
            batch: 1,
            session_ids: vec!["tensorflow:other:1:100".into()],
        };
        assert!(matches!(
            model.forward(&input),
            Err(ModelError::UnknownSession(_))
        ));
    }
}
