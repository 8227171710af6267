//! Scheduler control plane.
//!
//! Types for the directives a scheduler pushes to this node and for the
//! Register/Unregister/KeepAlive calls the node makes back. The scheduler
//! connection is behind the `SchedulerClient` trait so tests can use an
//! in-memory fake; the wire implementation speaks length-prefixed JSON
//! frames like the data plane.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;

use crate::session::ModelSession;
use crate::wire::{read_frame, write_frame, WireError};

/// Node type tag used in control-plane requests.
pub const BACKEND_NODE: u32 = 2;

/// Default scheduler port, appended when `--sch-addr` omits one.
pub const SCHEDULER_DEFAULT_PORT: u16 = 10001;

#[derive(Error, Debug)]
pub enum CtrlError {
    #[error("scheduler unreachable: {0}")]
    Unreachable(String),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("unexpected control message")]
    UnexpectedMessage,
}

/// Status codes of control-plane replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlStatus {
    Ok,
    BackendNodeIdConflict,
    ServerUnavailable,
    InvalidRequest,
}

/// A peer backend available for query relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub node_id: u32,
    pub address: String,
}

/// One model instance the scheduler wants resident on this node.
///
/// More than one session describes a composite model: a `tf_share`
/// suffix-group or a shared-prefix family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInstanceConfig {
    pub model_sessions: Vec<ModelSession>,
    pub batch: u32,
    #[serde(default)]
    pub backup: bool,
    #[serde(default)]
    pub backup_backends: Vec<BackendInfo>,
}

impl ModelInstanceConfig {
    pub fn new(model_sessions: Vec<ModelSession>, batch: u32) -> Self {
        Self { model_sessions, batch, backup: false, backup_backends: Vec::new() }
    }
}

/// The desired resident model set plus the GPU duty-cycle budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelTableConfig {
    pub model_instance_config: Vec<ModelInstanceConfig>,
    pub duty_cycle_us: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_type: u32,
    pub node_id: u32,
    pub server_port: u16,
    pub rpc_port: u16,
    pub gpu_device_name: String,
    pub gpu_available_memory: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReply {
    pub status: CtrlStatus,
    pub beacon_interval_sec: u64,
}

/// Control messages exchanged with the scheduler and on the RPC port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CtrlMessage {
    #[serde(rename = "register")]
    Register(RegisterRequest),

    #[serde(rename = "register_reply")]
    RegisterReply(RegisterReply),

    #[serde(rename = "unregister")]
    Unregister { node_type: u32, node_id: u32 },

    #[serde(rename = "keep_alive")]
    KeepAlive { node_type: u32, node_id: u32 },

    #[serde(rename = "reply")]
    Reply { status: CtrlStatus },

    #[serde(rename = "update_model_table")]
    UpdateModelTable(ModelTableConfig),

    #[serde(rename = "check_alive")]
    CheckAlive,
}

/// Client side of the scheduler control plane.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterReply, CtrlError>;
    async fn unregister(&self, node_id: u32) -> Result<CtrlStatus, CtrlError>;
    async fn keep_alive(&self, node_id: u32) -> Result<CtrlStatus, CtrlError>;
}

/// Scheduler client over TCP, one framed request/reply per call.
pub struct TcpSchedulerClient {
    addr: String,
}

impl TcpSchedulerClient {
    /// Create a client for `host[:port]`; the default scheduler port is
    /// appended when missing.
    pub fn new(sch_addr: &str) -> Self {
        let addr = if sch_addr.contains(':') {
            sch_addr.to_string()
        } else {
            format!("{sch_addr}:{SCHEDULER_DEFAULT_PORT}")
        };
        Self { addr }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, message: &CtrlMessage) -> Result<CtrlMessage, CtrlError> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| CtrlError::Unreachable(e.to_string()))?;
        let bytes = serde_json::to_vec(message).map_err(WireError::from)?;
        write_frame(&mut stream, &bytes).await?;
        let reply = read_frame(&mut stream).await?;
        Ok(serde_json::from_slice(&reply).map_err(WireError::from)?)
    }
}

#[async_trait]
impl SchedulerClient for TcpSchedulerClient {
    async fn register(&self, request: RegisterRequest) -> Result<RegisterReply, CtrlError> {
        match self.call(&CtrlMessage::Register(request)).await? {
            CtrlMessage::RegisterReply(reply) => Ok(reply),
            _ => Err(CtrlError::UnexpectedMessage),
        }
    }

    async fn unregister(&self, node_id: u32) -> Result<CtrlStatus, CtrlError> {
        let msg = CtrlMessage::Unregister { node_type: BACKEND_NODE, node_id };
        match self.call(&msg).await? {
            CtrlMessage::Reply { status } => Ok(status),
            _ => Err(CtrlError::UnexpectedMessage),
        }
    }

    async fn keep_alive(&self, node_id: u32) -> Result<CtrlStatus, CtrlError> {
        let msg = CtrlMessage::KeepAlive { node_type: BACKEND_NODE, node_id };
        match self.call(&msg).await? {
            CtrlMessage::Reply { status } => Ok(status),
            _ => Err(CtrlError::UnexpectedMessage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_appended() {
        let client = TcpSchedulerClient::new("10.0.0.1");
        assert_eq!(client.addr(), "10.0.0.1:10001");

        let client = TcpSchedulerClient::new("10.0.0.1:7777");
        assert_eq!(client.addr(), "10.0.0.1:7777");
    }

    #[test]
    fn directive_roundtrip() {
        let cfg = ModelTableConfig {
            model_instance_config: vec![ModelInstanceConfig::new(
                vec![ModelSession::new("tensorflow", "resnet50", 1, 100)],
                8,
            )],
            duty_cycle_us: 50_000,
        };
        let msg = CtrlMessage::UpdateModelTable(cfg);
        let bytes = serde_json::to_vec(&msg).unwrap();
        match serde_json::from_slice(&bytes).unwrap() {
            CtrlMessage::UpdateModelTable(got) => {
                assert_eq!(got.duty_cycle_us, 50_000);
                assert_eq!(got.model_instance_config.len(), 1);
                assert_eq!(got.model_instance_config[0].batch, 8);
            }
            other => panic!("wrong message type: {other:?}"),
        }
    }
}
