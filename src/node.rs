//! Backend node lifecycle.
//!
//! Wires the control plane (registration, heartbeat, directive
//! reconciliation) to the data plane (frontend connections, per-model
//! queues, the GPU executor) and owns every thread and task it spawns, so
//! `stop` can join them all.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::BackendConfig;
use crate::ctrl::{
    CtrlError, CtrlMessage, CtrlStatus, ModelTableConfig, RegisterRequest, SchedulerClient,
    BACKEND_NODE,
};
use crate::env::BackendEnvironment;
use crate::executor::ModelExecutor;
use crate::gpu::{GpuExecutor, GpuMode};
use crate::pool::{BackendPool, BackupClient};
use crate::session::ModelSession;
use crate::table::ModelTable;
use crate::task::{ReplyTx, Task};
use crate::telemetry::Gauge;
use crate::wire::{
    decode_message, encode_message, read_frame, write_frame, BackendMessage, QueryProto,
    QueryResultProto, QueryStatus, WireError,
};
use crate::worker::WorkerPool;

/// Poll interval of the reconciliation daemon.
const DIRECTIVE_POLL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("failed to reach scheduler: {0}")]
    Scheduler(#[from] CtrlError),

    #[error("scheduler rejected registration: {0:?}")]
    RegisterRejected(CtrlStatus),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A GPU-backed inference serving node.
pub struct BackendNode {
    config: BackendConfig,
    env: Arc<BackendEnvironment>,
    scheduler: Arc<dyn SchedulerClient>,
    workers: Arc<WorkerPool>,
    gpu: Arc<GpuExecutor>,
    pool: Arc<BackendPool>,
    table: Arc<ModelTable>,
    occupancy: Arc<Gauge>,
    node_id: AtomicU32,
    beacon_interval_sec: AtomicU64,
    running: CancellationToken,
    stopped: AtomicBool,
    directive_tx: mpsc::UnboundedSender<ModelTableConfig>,
    directive_rx: Mutex<Option<mpsc::UnboundedReceiver<ModelTableConfig>>>,
    tasks: TaskTracker,
    frontend_addr: Mutex<Option<SocketAddr>>,
    rpc_addr: Mutex<Option<SocketAddr>>,
}

impl BackendNode {
    /// Build the node: worker pool, GPU driver (started immediately),
    /// backup pool, and the model table that ties them together.
    pub fn new(
        config: BackendConfig,
        env: Arc<BackendEnvironment>,
        scheduler: Arc<dyn SchedulerClient>,
    ) -> Arc<Self> {
        let (gpu_core, worker_cores) = config.split_cores();
        let workers = Arc::new(WorkerPool::new(config.effective_workers(), &worker_cores));

        let mode = if config.multi_batch {
            info!("multi-batching is enabled");
            GpuMode::MultiBatching
        } else {
            info!("multi-batching is disabled");
            GpuMode::NoMultiBatching
        };
        let occupancy = Arc::new(Gauge::new());
        let gpu = Arc::new(GpuExecutor::new(
            mode,
            config.gpu,
            workers.clone(),
            occupancy.clone(),
        ));
        gpu.start(gpu_core);

        let pool = Arc::new(BackendPool::new());
        let table = Arc::new(ModelTable::new(env.clone(), gpu.clone(), pool.clone()));
        let (directive_tx, directive_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            config,
            env,
            scheduler,
            workers,
            gpu,
            pool,
            table,
            occupancy,
            node_id: AtomicU32::new(0),
            beacon_interval_sec: AtomicU64::new(1),
            running: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            directive_tx,
            directive_rx: Mutex::new(Some(directive_rx)),
            tasks: TaskTracker::new(),
            frontend_addr: Mutex::new(None),
            rpc_addr: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id.load(Ordering::SeqCst)
    }

    pub fn table(&self) -> &Arc<ModelTable> {
        &self.table
    }

    pub fn gpu(&self) -> &Arc<GpuExecutor> {
        &self.gpu
    }

    pub fn backend_pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Address of the frontend listener once `run` has bound it.
    pub fn frontend_addr(&self) -> Option<SocketAddr> {
        *self.frontend_addr.lock()
    }

    /// Address of the control listener once `run` has bound it.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        *self.rpc_addr.lock()
    }

    /// Queue a directive; the reconciliation daemon applies it in arrival
    /// order.
    pub fn update_model_table_async(&self, directive: ModelTableConfig) {
        let _ = self.directive_tx.send(directive);
    }

    /// Register with the scheduler, then start every daemon and listener.
    /// Returns once the node is serving; a fatal registration error is
    /// propagated instead.
    pub async fn run(self: &Arc<Self>) -> Result<(), NodeError> {
        self.register().await?;

        let frontend = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        let rpc = TcpListener::bind(("0.0.0.0", self.config.rpc_port)).await?;
        *self.frontend_addr.lock() = frontend.local_addr().ok();
        *self.rpc_addr.lock() = rpc.local_addr().ok();

        let node = self.clone();
        self.tasks.spawn(async move { node.heartbeat_daemon().await });

        let node = self.clone();
        self.tasks.spawn(async move { node.reconcile_daemon().await });

        let node = self.clone();
        self.tasks.spawn(async move { node.accept_loop(frontend).await });

        let node = self.clone();
        self.tasks.spawn(async move { node.rpc_accept_loop(rpc).await });

        info!(
            node_id = self.node_id(),
            addr = %self.frontend_addr().map(|a| a.to_string()).unwrap_or_default(),
            "backend node is listening"
        );
        Ok(())
    }

    /// Stop everything: cancel daemons and connections, unregister, join
    /// the GPU driver and workers, and wait for every spawned task.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.cancel();

        if let Err(e) = self.scheduler.unregister(self.node_id()).await {
            error!(error = %e, "unregister failed");
        }

        tokio::task::block_in_place(|| {
            self.gpu.stop();
            self.workers.stop();
        });
        self.pool.clear();

        self.tasks.close();
        self.tasks.wait().await;
        info!("backend node stopped");
    }

    /// Pick a random node id and register, regenerating on conflict. Any
    /// other rejection is fatal.
    async fn register(&self) -> Result<(), NodeError> {
        loop {
            let node_id = {
                let mut rng = rand::thread_rng();
                rng.gen_range(1..u32::MAX)
            };
            let request = RegisterRequest {
                node_type: BACKEND_NODE,
                node_id,
                server_port: self.config.port,
                rpc_port: self.config.rpc_port,
                gpu_device_name: self.env.device.device_name.clone(),
                gpu_available_memory: self.env.device.free_memory,
            };
            let reply = self.scheduler.register(request).await?;
            match reply.status {
                CtrlStatus::Ok => {
                    self.node_id.store(node_id, Ordering::SeqCst);
                    self.beacon_interval_sec
                        .store(reply.beacon_interval_sec.max(1), Ordering::SeqCst);
                    info!(node_id, beacon = reply.beacon_interval_sec, "registered with scheduler");
                    return Ok(());
                }
                CtrlStatus::BackendNodeIdConflict => {
                    warn!(node_id, "node id conflict, regenerating");
                }
                status => return Err(NodeError::RegisterRejected(status)),
            }
        }
    }

    /// KeepAlive plus per-model rate logging, every beacon interval.
    async fn heartbeat_daemon(self: Arc<Self>) {
        loop {
            let interval = Duration::from_secs(self.beacon_interval_sec.load(Ordering::SeqCst));
            tokio::select! {
                () = self.running.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            match self.scheduler.keep_alive(self.node_id()).await {
                Ok(CtrlStatus::Ok) => {}
                Ok(status) => error!(?status, "keep alive rejected"),
                Err(e) => error!(error = %e, "keep alive failed"),
            }
            for (session_id, model) in self.table.snapshot() {
                let rps = model.get_request_rate();
                if rps > 0.1 {
                    info!(
                        session = %session_id,
                        request_rate = rps,
                        drop_rate = model.get_drop_rate(),
                        "model load"
                    );
                }
            }
        }
    }

    /// Apply queued directives strictly in arrival order.
    async fn reconcile_daemon(self: Arc<Self>) {
        let Some(mut rx) = self.directive_rx.lock().take() else {
            error!("reconcile daemon started twice");
            return;
        };
        loop {
            tokio::select! {
                () = self.running.cancelled() => break,
                polled = tokio::time::timeout(DIRECTIVE_POLL, rx.recv()) => match polled {
                    Ok(Some(directive)) => self.table.update(&directive),
                    Ok(None) => break,
                    Err(_) => {} // poll timeout, check the running flag
                },
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.running.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let node = self.clone();
                        self.tasks.spawn(async move { node.handle_connection(stream).await });
                    }
                    Err(e) => warn!(error = %e, "frontend accept error"),
                },
            }
        }
    }

    /// Serve one frontend (or relaying peer) connection.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let (mut reader, mut writer) = stream.into_split();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<BackendMessage>();

        let running = self.running.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    () = running.cancelled() => break,
                    msg = reply_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let Ok(bytes) = encode_message(&msg) else { continue };
                        if write_frame(&mut writer, &bytes).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        loop {
            let bytes = tokio::select! {
                () = self.running.cancelled() => break,
                read = read_frame(&mut reader) => match read {
                    Ok(bytes) => bytes,
                    // EOF and reset mean the frontend went away; silent.
                    Err(WireError::Io(e))
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::UnexpectedEof
                                | std::io::ErrorKind::ConnectionReset
                        ) =>
                    {
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "frontend connection error");
                        break;
                    }
                },
            };
            match decode_message(&bytes) {
                Ok(BackendMessage::Request(query)) => self.handle_query(query, false, &reply_tx),
                Ok(BackendMessage::Relay(query)) => self.handle_query(query, true, &reply_tx),
                Ok(other) => warn!(message = ?other, "wrong message type"),
                Err(e) => {
                    warn!(error = %e, "frontend protocol error, closing connection");
                    break;
                }
            }
        }
    }

    /// Route a decoded query: unknown sessions are answered immediately,
    /// overloaded models relay to a backup, everything else enqueues for
    /// the GPU.
    fn handle_query(self: &Arc<Self>, query: QueryProto, relayed: bool, reply_tx: &ReplyTx) {
        let session: ModelSession = match query.model_session_id.parse() {
            Ok(session) => session,
            Err(e) => {
                self.reply_error(
                    reply_tx,
                    relayed,
                    query.query_id,
                    QueryStatus::ModelSessionNotLoaded,
                    e.to_string(),
                );
                return;
            }
        };
        let Some(model) = self.table.get_model(&query.model_session_id) else {
            self.reply_error(
                reply_tx,
                relayed,
                query.query_id,
                QueryStatus::ModelSessionNotLoaded,
                format!("model session is not loaded: {}", query.model_session_id),
            );
            return;
        };

        let task = Task::new(
            query.clone(),
            session,
            relayed,
            reply_tx.clone(),
            self.occupancy.clone(),
        );

        // Relayed queries are served locally; only first-hop queries may
        // relay onward.
        if !relayed && model.should_relay(&task) {
            if let Some(backup) = self.pick_backup(&model) {
                info!(peer = backup.node_id(), query = query.query_id, "relaying query");
                let deadline = task.deadline;
                self.tasks.spawn(async move {
                    let result = backup.relay(query, deadline).await;
                    task.complete_with(result);
                });
                return;
            }
        }
        model.add_task(task);
    }

    /// First configured backup with a fresh occupancy report of ≤ 1.0,
    /// scanning in round-robin order.
    fn pick_backup(&self, model: &Arc<ModelExecutor>) -> Option<Arc<BackupClient>> {
        let valid = Duration::from_millis(self.config.occupancy_valid_ms);
        for _ in 0..model.backup_backends().len() {
            let node_id = model.next_backup()?;
            let Some(client) = self.pool.get_backend(node_id) else { continue };
            match client.fresh_occupancy(valid) {
                Some(occupancy) if occupancy <= 1.0 => return Some(client),
                _ => continue,
            }
        }
        None
    }

    fn reply_error(
        &self,
        reply_tx: &ReplyTx,
        relayed: bool,
        query_id: u64,
        status: QueryStatus,
        message: String,
    ) {
        let result = QueryResultProto::error(query_id, status, message);
        let msg = if relayed {
            BackendMessage::RelayReply { result, occupancy: self.occupancy.get() }
        } else {
            BackendMessage::Reply(result)
        };
        let _ = reply_tx.send(msg);
    }

    async fn rpc_accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.running.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let node = self.clone();
                        self.tasks.spawn(async move { node.handle_rpc_connection(stream).await });
                    }
                    Err(e) => warn!(error = %e, "rpc accept error"),
                },
            }
        }
    }

    /// Serve scheduler RPCs: directives are queued and acknowledged
    /// immediately, CheckAlive answers inline.
    async fn handle_rpc_connection(self: Arc<Self>, mut stream: TcpStream) {
        loop {
            let bytes = tokio::select! {
                () = self.running.cancelled() => break,
                read = read_frame(&mut stream) => match read {
                    Ok(bytes) => bytes,
                    Err(_) => break,
                },
            };
            let status = match serde_json::from_slice::<CtrlMessage>(&bytes) {
                Ok(CtrlMessage::UpdateModelTable(directive)) => {
                    self.update_model_table_async(directive);
                    CtrlStatus::Ok
                }
                Ok(CtrlMessage::CheckAlive) => CtrlStatus::Ok,
                Ok(other) => {
                    warn!(message = ?other, "unexpected rpc message");
                    CtrlStatus::InvalidRequest
                }
                Err(e) => {
                    warn!(error = %e, "rpc protocol error");
                    CtrlStatus::InvalidRequest
                }
            };
            let reply = CtrlMessage::Reply { status };
            let Ok(bytes) = serde_json::to_vec(&reply) else { break };
            if write_frame(&mut stream, &bytes).await.is_err() {
                break;
            }
        }
    }
}
