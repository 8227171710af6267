//! Relay path tests: a backup client forwarding queries to a live peer
//! backend and correlating the replies by query id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use infernode::config::BackendConfig;
use infernode::ctrl::{
    BackendInfo, CtrlError, CtrlStatus, ModelInstanceConfig, ModelTableConfig, RegisterReply,
    RegisterRequest, SchedulerClient,
};
use infernode::env::{BackendEnvironment, GpuDevice};
use infernode::model::database::{ModelDatabase, ModelEntry, ModelProfile};
use infernode::node::BackendNode;
use infernode::pool::BackupClient;
use infernode::session::ModelSession;
use infernode::wire::{QueryProto, QueryStatus};

struct AlwaysOkScheduler;

#[async_trait]
impl SchedulerClient for AlwaysOkScheduler {
    async fn register(&self, _request: RegisterRequest) -> Result<RegisterReply, CtrlError> {
        Ok(RegisterReply { status: CtrlStatus::Ok, beacon_interval_sec: 1 })
    }

    async fn unregister(&self, _node_id: u32) -> Result<CtrlStatus, CtrlError> {
        Ok(CtrlStatus::Ok)
    }

    async fn keep_alive(&self, _node_id: u32) -> Result<CtrlStatus, CtrlError> {
        Ok(CtrlStatus::Ok)
    }
}

async fn start_peer() -> (Arc<BackendNode>, ModelSession) {
    let mut db = ModelDatabase::new();
    db.insert(ModelEntry {
        framework: "tensorflow".into(),
        model_name: "model_a".into(),
        profile: ModelProfile { input_size: 8, output_size: 4, forward_latency_us: 200 },
        prefix_length: 0,
        suffix_models: Default::default(),
    });
    let env = BackendEnvironment::new(GpuDevice::probe(0), db);
    let config = BackendConfig { port: 0, rpc_port: 0, workers: 2, ..BackendConfig::default() };
    let node = BackendNode::new(config, env, Arc::new(AlwaysOkScheduler));
    node.run().await.unwrap();

    let session = ModelSession::new("tensorflow", "model_a", 1, 1_000);
    node.update_model_table_async(ModelTableConfig {
        model_instance_config: vec![ModelInstanceConfig::new(vec![session.clone()], 4)],
        duty_cycle_us: 5_000,
    });
    for _ in 0..200 {
        if node.table().snapshot().contains_key(&session.id()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (node, session)
}

fn query(query_id: u64, session: &ModelSession) -> QueryProto {
    QueryProto {
        query_id,
        model_session_id: session.id(),
        input: vec![7; 8],
        window: Vec::new(),
    }
}

// === Relayed query served by a live peer, matched by query id ===

#[tokio::test(flavor = "multi_thread")]
async fn relay_round_trip_matches_query_id() {
    let (peer, session) = start_peer().await;
    let client = BackupClient::new(BackendInfo {
        node_id: 2,
        address: format!("127.0.0.1:{}", peer.frontend_addr().unwrap().port()),
    });

    let result = client
        .relay(query(4242, &session), Instant::now() + Duration::from_secs(2))
        .await;
    assert_eq!(result.query_id, 4242);
    assert_eq!(result.status, QueryStatus::Ok);
    assert_eq!(result.outputs.len(), 1);

    // The reply carried the peer's occupancy.
    assert!(client.fresh_occupancy(Duration::from_secs(5)).is_some());
    peer.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_relays_resolve_independently() {
    let (peer, session) = start_peer().await;
    let client = BackupClient::new(BackendInfo {
        node_id: 2,
        address: format!("127.0.0.1:{}", peer.frontend_addr().unwrap().port()),
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    let a = client.relay(query(1, &session), deadline);
    let b = client.relay(query(2, &session), deadline);
    let c = client.relay(query(3, &session), deadline);
    let (ra, rb, rc) = tokio::join!(a, b, c);

    assert_eq!(ra.query_id, 1);
    assert_eq!(rb.query_id, 2);
    assert_eq!(rc.query_id, 3);
    for r in [ra, rb, rc] {
        assert_eq!(r.status, QueryStatus::Ok);
    }
    peer.stop().await;
}

// === Failure paths resolve to RelayFailed ===

#[tokio::test(flavor = "multi_thread")]
async fn relay_to_unreachable_peer_fails() {
    let client = BackupClient::new(BackendInfo {
        node_id: 3,
        // Port 1 on loopback: nothing listens, connect is refused.
        address: "127.0.0.1:1".to_string(),
    });
    let session = ModelSession::new("tensorflow", "model_a", 1, 1_000);

    let result = client
        .relay(query(9, &session), Instant::now() + Duration::from_millis(500))
        .await;
    assert_eq!(result.query_id, 9);
    assert_eq!(result.status, QueryStatus::RelayFailed);
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_times_out_against_silent_peer() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Accept and hold the connection without ever replying.
    let hold = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = BackupClient::new(BackendInfo { node_id: 4, address: addr.to_string() });
    let session = ModelSession::new("tensorflow", "model_a", 1, 1_000);

    let result = client
        .relay(query(11, &session), Instant::now() + Duration::from_millis(200))
        .await;
    assert_eq!(result.status, QueryStatus::RelayFailed);
    hold.abort();
}
