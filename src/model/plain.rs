//! Plain single-session model runner.

use super::database::ModelEntry;
use super::network::Network;
use super::{BatchInput, BatchOutput, ModelError, SharedDatabase};
use crate::session::ModelSession;

/// One session, one network graph.
pub struct PlainModel {
    session_id: String,
    network: Network,
    forward_latency_us: u64,
}

impl PlainModel {
    pub fn load(db: &SharedDatabase, session: &ModelSession) -> Result<Self, ModelError> {
        let entry: &ModelEntry = db
            .get(&session.model_name)
            .ok_or_else(|| ModelError::MissingEntry(session.model_name.clone()))?;
        Ok(Self {
            session_id: session.id(),
            network: Network::from_entry(entry),
            forward_latency_us: entry.profile.forward_latency_us,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn input_size(&self) -> usize {
        self.network.input_size()
    }

    pub fn forward_latency_us(&self) -> u64 {
        self.forward_latency_us
    }

    pub fn forward(&self, input: &BatchInput) -> Result<BatchOutput, ModelError> {
        let flat = self.network.forward(&input.data, input.batch);
        let outputs = flat
            .chunks(self.network.output_size())
            .map(<[f32]>::to_vec)
            .collect();
        Ok(BatchOutput { outputs })
    }
}
