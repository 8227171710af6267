//! Model table reconciliation.
//!
//! The table maps session ids to resident model executors and is the
//! single authority on what this node serves. Applying a scheduler
//! directive mutates it in phases: refresh the backup pool, evict sessions
//! the directive no longer wants, install or update the wanted configs,
//! then set the duty cycle. The whole apply runs under one lock, so
//! `get_model` is linearizable with respect to directives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::ctrl::{BackendInfo, ModelInstanceConfig, ModelTableConfig};
use crate::env::BackendEnvironment;
use crate::executor::ModelExecutor;
use crate::gpu::GpuExecutor;
use crate::model::{ModelKind, ModelRunner, PlainModel, SharePrefixModel, TfShareModel};
use crate::pool::{BackendPool, BackupClient};

type TableMap = HashMap<String, Arc<ModelExecutor>>;

/// Session-id → executor mapping, reconciled against scheduler directives.
pub struct ModelTable {
    env: Arc<BackendEnvironment>,
    gpu: Arc<GpuExecutor>,
    pool: Arc<BackendPool>,
    table: Mutex<TableMap>,
}

impl ModelTable {
    pub fn new(
        env: Arc<BackendEnvironment>,
        gpu: Arc<GpuExecutor>,
        pool: Arc<BackendPool>,
    ) -> Self {
        Self { env, gpu, pool, table: Mutex::new(HashMap::new()) }
    }

    pub fn get_model(&self, session_id: &str) -> Option<Arc<ModelExecutor>> {
        let table = self.table.lock();
        let model = table.get(session_id).cloned();
        if model.is_none() {
            warn!(session_id, "model session is not loaded");
        }
        model
    }

    /// Copy of the current mapping (heartbeat reporting).
    pub fn snapshot(&self) -> TableMap {
        self.table.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Apply one scheduler directive. Invalid configs are skipped (and
    /// logged); the rest of the directive still takes effect.
    pub fn update(&self, directive: &ModelTableConfig) {
        self.refresh_backup_pool(directive);

        let desired: HashSet<String> = directive
            .model_instance_config
            .iter()
            .flat_map(|c| c.model_sessions.iter().map(|s| s.id()))
            .collect();

        let mut table = self.table.lock();

        // Evict sessions the directive no longer wants.
        let stale: Vec<String> = table
            .keys()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect();
        for session_id in stale {
            self.detach(&mut table, &session_id);
        }

        for config in &directive.model_instance_config {
            match config.model_sessions.len() {
                0 => warn!("directive config with no sessions skipped"),
                1 => self.install_plain(&mut table, config),
                _ if config.model_sessions[0].framework == "tf_share" => {
                    self.install_tf_share(&mut table, config);
                }
                _ => self.install_share_prefix(&mut table, config),
            }
        }

        self.gpu.set_duty_cycle(directive.duty_cycle_us);
        info!(duty_cycle_us = directive.duty_cycle_us, models = table.len(), "model table updated");
    }

    /// Phase 1: pool membership follows the union of backup backends.
    fn refresh_backup_pool(&self, directive: &ModelTableConfig) {
        let mut desired = HashSet::new();
        let mut infos: HashMap<u32, BackendInfo> = HashMap::new();
        for config in &directive.model_instance_config {
            for backend in &config.backup_backends {
                desired.insert(backend.node_id);
                infos.entry(backend.node_id).or_insert_with(|| backend.clone());
            }
        }
        for node_id in self.pool.update_backend_list(&desired) {
            if let Some(info) = infos.remove(&node_id) {
                self.pool.add_backend(BackupClient::new(info));
            }
        }
    }

    /// Detach one session from the table, removing its executor from the
    /// GPU when no session keeps it alive.
    fn detach(&self, table: &mut TableMap, session_id: &str) {
        let Some(model) = table.remove(session_id) else { return };
        match model.kind() {
            ModelKind::Plain => {
                info!(session_id, "remove model instance");
                self.gpu.remove_model(&model);
            }
            ModelKind::SharePrefix | ModelKind::TfShare => {
                let mut runner = model.runner_mut();
                match runner.remove_model_session(session_id) {
                    Ok(true) => info!(session_id, "remove session from composite model"),
                    Ok(false) => error!(session_id, "session missing from composite model"),
                    Err(e) => error!(session_id, error = %e, "composite detach failed"),
                }
                let empty = runner.num_model_sessions() == 0;
                drop(runner);
                if empty {
                    info!(session_id, "remove composite model instance");
                    self.gpu.remove_model(&model);
                }
            }
        }
    }

    /// Reuse lookup for composite installs: the first of the config's
    /// sessions already present in the table. A present executor of a
    /// different kind is evicted so the composite can be created fresh.
    fn find_or_evict(
        &self,
        table: &mut TableMap,
        config: &ModelInstanceConfig,
        wanted: ModelKind,
    ) -> Option<Arc<ModelExecutor>> {
        for session in &config.model_sessions {
            let session_id = session.id();
            let Some(model) = table.get(&session_id).cloned() else { continue };
            if model.kind() == wanted {
                return Some(model);
            }
            self.detach(table, &session_id);
        }
        None
    }

    fn install_tf_share(&self, table: &mut TableMap, config: &ModelInstanceConfig) {
        let first = &config.model_sessions[0];
        let Some(trunk) = self.env.model_db.tf_share_info(&first.model_name) else {
            error!(model = %first.model_name, "tf_share trunk not in model database; config skipped");
            return;
        };
        for session in &config.model_sessions[1..] {
            if !trunk.suffix_models.contains(&session.model_name) {
                error!(
                    trunk = %trunk.model_name,
                    model = %session.model_name,
                    "suffix model not declared by trunk; config skipped"
                );
                return;
            }
        }

        if let Some(model) = self.find_or_evict(table, config, ModelKind::TfShare) {
            self.reuse_composite(table, config, &model);
            return;
        }

        match TfShareModel::load(&self.env.model_db, &config.model_sessions) {
            Ok(runner) => {
                info!(
                    trunk = %trunk.model_name,
                    sessions = config.model_sessions.len(),
                    batch = config.batch,
                    "load tf_share model instance"
                );
                self.insert_new(table, config, ModelRunner::TfShare(runner));
            }
            Err(e) => error!(error = %e, "tf_share load failed; config skipped"),
        }
    }

    fn install_share_prefix(&self, table: &mut TableMap, config: &ModelInstanceConfig) {
        if let Some(model) = self.find_or_evict(table, config, ModelKind::SharePrefix) {
            self.reuse_composite(table, config, &model);
            return;
        }

        match SharePrefixModel::load(&self.env.model_db, &config.model_sessions) {
            Ok(runner) => {
                info!(
                    lead = %config.model_sessions[0].id(),
                    sessions = config.model_sessions.len(),
                    batch = config.batch,
                    backup = config.backup,
                    "load prefix model instance"
                );
                self.insert_new(table, config, ModelRunner::SharePrefix(runner));
            }
            Err(e) => error!(error = %e, "prefix model load failed; config skipped"),
        }
    }

    fn install_plain(&self, table: &mut TableMap, config: &ModelInstanceConfig) {
        let session = &config.model_sessions[0];
        let session_id = session.id();

        if let Some(model) = table.get(&session_id) {
            if model.batch() != config.batch {
                info!(session_id, old = model.batch(), new = config.batch, "update batch size");
                model.set_batch(config.batch);
            }
            model.update_backup_backends(config);
            return;
        }

        match PlainModel::load(&self.env.model_db, session) {
            Ok(runner) => {
                info!(session_id, batch = config.batch, backup = config.backup, "load model instance");
                self.insert_new(table, config, ModelRunner::Plain(runner));
            }
            Err(e) => error!(session_id, error = %e, "model load failed; config skipped"),
        }
    }

    /// Update an existing composite executor in place: batch, newly bound
    /// sessions, backup set.
    fn reuse_composite(
        &self,
        table: &mut TableMap,
        config: &ModelInstanceConfig,
        model: &Arc<ModelExecutor>,
    ) {
        if model.batch() != config.batch {
            info!(old = model.batch(), new = config.batch, "update composite batch size");
            model.set_batch(config.batch);
        }
        let mut runner = model.runner_mut();
        for session in &config.model_sessions {
            let session_id = session.id();
            if runner.has_model_session(&session_id) {
                continue;
            }
            match runner.add_model_session(session) {
                Ok(true) => {
                    info!(session_id, "add session to composite model");
                    table.insert(session_id, model.clone());
                }
                Ok(false) => {}
                Err(e) => error!(session_id, error = %e, "add session failed"),
            }
        }
        drop(runner);
        model.update_backup_backends(config);
    }

    /// Create an executor for `runner`, make it GPU-resident, and map all
    /// of the config's sessions to it.
    fn insert_new(&self, table: &mut TableMap, config: &ModelInstanceConfig, runner: ModelRunner) {
        let model = ModelExecutor::new(runner, config.batch);
        model.update_backup_backends(config);
        self.gpu.add_model(&model);
        for session in &config.model_sessions {
            table.insert(session.id(), model.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::ModelInstanceConfig;
    use crate::env::GpuDevice;
    use crate::gpu::GpuMode;
    use crate::model::database::{ModelDatabase, ModelEntry, ModelProfile};
    use crate::session::ModelSession;
    use crate::telemetry::Gauge;
    use crate::worker::WorkerPool;

    fn entry(framework: &str, name: &str, suffixes: &[&str]) -> ModelEntry {
        ModelEntry {
            framework: framework.into(),
            model_name: name.into(),
            profile: ModelProfile { input_size: 4, output_size: 2, forward_latency_us: 1000 },
            prefix_length: 2,
            suffix_models: suffixes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn fixture() -> (ModelTable, Arc<GpuExecutor>) {
        let mut db = ModelDatabase::new();
        db.insert(entry("tensorflow", "resnet50", &[]));
        db.insert(entry("tensorflow", "vgg16", &[]));
        db.insert(entry("tf_share", "shared_trunk", &["heads_a", "heads_b"]));
        let env = BackendEnvironment::new(GpuDevice::probe(0), db);
        let workers = Arc::new(WorkerPool::new(1, &[]));
        let gpu = Arc::new(GpuExecutor::new(
            GpuMode::MultiBatching,
            0,
            workers,
            Arc::new(Gauge::new()),
        ));
        let pool = Arc::new(BackendPool::new());
        (ModelTable::new(env, gpu.clone(), pool), gpu)
    }

    fn plain_directive(batch: u32, duty_cycle_us: u64) -> ModelTableConfig {
        ModelTableConfig {
            model_instance_config: vec![ModelInstanceConfig::new(
                vec![ModelSession::new("tensorflow", "resnet50", 1, 100)],
                batch,
            )],
            duty_cycle_us,
        }
    }

    #[test]
    fn apply_installs_and_sets_duty_cycle() {
        let (table, gpu) = fixture();
        table.update(&plain_directive(4, 50_000));

        let model = table.get_model("tensorflow:resnet50:1:100").unwrap();
        assert_eq!(model.batch(), 4);
        assert_eq!(gpu.resident_count(), 1);
        assert_eq!(gpu.duty_cycle_us(), 50_000);
    }

    #[test]
    fn batch_update_preserves_executor_identity() {
        let (table, gpu) = fixture();
        table.update(&plain_directive(4, 50_000));
        let before = table.get_model("tensorflow:resnet50:1:100").unwrap();

        table.update(&plain_directive(16, 50_000));
        let after = table.get_model("tensorflow:resnet50:1:100").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.batch(), 16);
        assert_eq!(gpu.resident_count(), 1);
    }

    #[test]
    fn empty_directive_evicts_everything() {
        let (table, gpu) = fixture();
        table.update(&plain_directive(4, 50_000));
        table.update(&ModelTableConfig { model_instance_config: vec![], duty_cycle_us: 0 });

        assert!(table.is_empty());
        assert_eq!(gpu.resident_count(), 0);
    }

    #[test]
    fn unknown_model_config_is_skipped_but_rest_applies() {
        let (table, gpu) = fixture();
        let directive = ModelTableConfig {
            model_instance_config: vec![
                ModelInstanceConfig::new(
                    vec![ModelSession::new("tensorflow", "missing", 1, 100)],
                    4,
                ),
                ModelInstanceConfig::new(
                    vec![ModelSession::new("tensorflow", "resnet50", 1, 100)],
                    4,
                ),
            ],
            duty_cycle_us: 10_000,
        };
        table.update(&directive);

        assert!(table.get_model("tensorflow:missing:1:100").is_none());
        assert!(table.get_model("tensorflow:resnet50:1:100").is_some());
        assert_eq!(gpu.resident_count(), 1);
    }
}
