//! infernode - GPU-backed inference serving node.
//!
//! One node in a cluster-scheduled model serving system. A central
//! scheduler decides which model instances live on which backend, at what
//! batch size, and under what GPU duty-cycle budget; this crate is the
//! backend: it reconciles its resident model set against scheduler
//! directives, queues incoming queries per model, drives them through
//! duty-cycle-bounded batched forward passes, and relays to peer backends
//! when overloaded.
//!
//! # Architecture
//!
//! - **Control plane**: registration and heartbeat against the scheduler,
//!   plus a directive queue applied by a single reconciliation daemon.
//! - **Data plane**: framed TCP connections from frontends and peers feed
//!   per-model task queues; one GPU driver thread batches them under the
//!   assigned duty cycle, with preprocess/postprocess on a worker pool.
//! - **Composite models**: shared-prefix families and `tf_share` trunks
//!   bind several sessions to one executor; the table keeps their session
//!   sets and GPU residency consistent across directives.

pub mod config;
pub mod ctrl;
pub mod env;
pub mod executor;
pub mod gpu;
pub mod model;
pub mod node;
pub mod pool;
pub mod queue;
pub mod session;
pub mod table;
pub mod task;
pub mod telemetry;
pub mod wire;
pub mod worker;

pub use config::{BackendConfig, Cli};
pub use ctrl::{
    BackendInfo, CtrlStatus, ModelInstanceConfig, ModelTableConfig, RegisterReply,
    RegisterRequest, SchedulerClient, TcpSchedulerClient,
};
pub use env::{BackendEnvironment, GpuDevice};
pub use executor::ModelExecutor;
pub use gpu::{GpuExecutor, GpuMode};
pub use model::{ModelDatabase, ModelKind, ModelRunner};
pub use node::{BackendNode, NodeError};
pub use pool::{BackendPool, BackupClient};
pub use session::ModelSession;
pub use table::ModelTable;
pub use task::Task;
pub use wire::{BackendMessage, QueryProto, QueryResultProto, QueryStatus};
