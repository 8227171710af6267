//! Peer-backend pool and relay clients.
//!
//! When this node is overloaded it forwards queries to backup backends
//! assigned by the scheduler. A `BackupClient` keeps one lazily-opened
//! connection per peer and correlates relay replies to outstanding relays
//! by query id; the pool tracks the union of backup backends across the
//! applied directive.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ctrl::BackendInfo;
use crate::wire::{
    decode_message, encode_message, read_frame, write_frame, BackendMessage, QueryProto,
    QueryResultProto, QueryStatus, WireError,
};

/// Connection to one backup backend.
pub struct BackupClient {
    info: BackendInfo,
    conn: tokio::sync::Mutex<Option<mpsc::UnboundedSender<BackendMessage>>>,
    pending: DashMap<u64, oneshot::Sender<QueryResultProto>>,
    occupancy: Mutex<Option<(f64, Instant)>>,
    closed: CancellationToken,
}

impl BackupClient {
    pub fn new(info: BackendInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            conn: tokio::sync::Mutex::new(None),
            pending: DashMap::new(),
            occupancy: Mutex::new(None),
            closed: CancellationToken::new(),
        })
    }

    pub fn node_id(&self) -> u32 {
        self.info.node_id
    }

    pub fn address(&self) -> &str {
        &self.info.address
    }

    /// Last reported occupancy, if fresher than `valid`.
    pub fn fresh_occupancy(&self, valid: Duration) -> Option<f64> {
        let guard = self.occupancy.lock();
        let (value, reported_at) = (*guard)?;
        (reported_at.elapsed() <= valid).then_some(value)
    }

    fn report_occupancy(&self, value: f64) {
        *self.occupancy.lock() = Some((value, Instant::now()));
    }

    /// Relay a query to this peer and wait for the matching reply until
    /// `deadline`. Failures and timeouts resolve to a `RelayFailed` result.
    pub async fn relay(self: &Arc<Self>, query: QueryProto, deadline: Instant) -> QueryResultProto {
        let query_id = query.query_id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(query_id, tx);

        let send_result = self.send(BackendMessage::Relay(query)).await;
        if let Err(e) = send_result {
            self.pending.remove(&query_id);
            warn!(peer = self.info.node_id, error = %e, "relay send failed");
            return QueryResultProto::error(query_id, QueryStatus::RelayFailed, e.to_string());
        }

        match tokio::time::timeout_at(deadline.into(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => QueryResultProto::error(
                query_id,
                QueryStatus::RelayFailed,
                "backup connection closed",
            ),
            Err(_) => {
                self.pending.remove(&query_id);
                QueryResultProto::error(query_id, QueryStatus::RelayFailed, "relay timed out")
            }
        }
    }

    async fn send(self: &Arc<Self>, message: BackendMessage) -> Result<(), WireError> {
        let tx = self.ensure_conn().await?;
        tx.send(message)
            .map_err(|_| WireError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
    }

    /// Open the peer connection on first use (or after a disconnect) and
    /// spawn its reader/writer halves.
    async fn ensure_conn(
        self: &Arc<Self>,
    ) -> Result<mpsc::UnboundedSender<BackendMessage>, WireError> {
        let mut guard = self.conn.lock().await;
        if let Some(tx) = guard.as_ref() {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }

        let stream = TcpStream::connect(&self.info.address).await?;
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<BackendMessage>();

        let closed = self.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = closed.cancelled() => break,
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        let Ok(bytes) = encode_message(&msg) else { continue };
                        if write_frame(&mut writer, &bytes).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                let bytes = tokio::select! {
                    () = client.closed.cancelled() => break,
                    read = read_frame(&mut reader) => match read {
                        Ok(bytes) => bytes,
                        Err(_) => break,
                    },
                };
                match decode_message(&bytes) {
                    Ok(BackendMessage::RelayReply { result, occupancy }) => {
                        client.report_occupancy(occupancy);
                        if let Some((_, tx)) = client.pending.remove(&result.query_id) {
                            let _ = tx.send(result);
                        } else {
                            debug!(peer = client.info.node_id, "reply with no outstanding relay");
                        }
                    }
                    Ok(other) => {
                        warn!(peer = client.info.node_id, message = ?other, "unexpected peer message");
                    }
                    Err(e) => {
                        warn!(peer = client.info.node_id, error = %e, "peer protocol error");
                        break;
                    }
                }
            }
            client.fail_pending();
        });

        *guard = Some(tx.clone());
        Ok(tx)
    }

    /// Resolve every outstanding relay as failed (connection lost).
    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(QueryResultProto::error(
                    id,
                    QueryStatus::RelayFailed,
                    "backup connection lost",
                ));
            }
        }
    }

    /// Tear the connection down and fail outstanding relays.
    pub fn close(&self) {
        self.closed.cancel();
        self.fail_pending();
    }
}

/// All backup backends the current directive references.
#[derive(Default)]
pub struct BackendPool {
    backends: DashMap<u32, Arc<BackupClient>>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile membership against `desired`. Absent entries are closed
    /// and dropped; the returned ids are the ones the caller must create
    /// clients for.
    pub fn update_backend_list(&self, desired: &HashSet<u32>) -> Vec<u32> {
        let stale: Vec<u32> = self
            .backends
            .iter()
            .map(|e| *e.key())
            .filter(|id| !desired.contains(id))
            .collect();
        for id in stale {
            if let Some((_, client)) = self.backends.remove(&id) {
                client.close();
            }
        }
        desired
            .iter()
            .copied()
            .filter(|id| !self.backends.contains_key(id))
            .collect()
    }

    pub fn add_backend(&self, client: Arc<BackupClient>) {
        self.backends.insert(client.node_id(), client);
    }

    pub fn get_backend(&self, node_id: u32) -> Option<Arc<BackupClient>> {
        self.backends.get(&node_id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Close every client (node shutdown).
    pub fn clear(&self) {
        for entry in self.backends.iter() {
            entry.value().close();
        }
        self.backends.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(node_id: u32) -> BackendInfo {
        BackendInfo { node_id, address: format!("127.0.0.1:{}", 20000 + node_id) }
    }

    #[test]
    fn membership_tracks_desired_set() {
        let pool = BackendPool::new();
        let desired: HashSet<u32> = [1, 2].into_iter().collect();
        let missing = pool.update_backend_list(&desired);
        assert_eq!(missing.len(), 2);
        for id in missing {
            pool.add_backend(BackupClient::new(info(id)));
        }
        assert_eq!(pool.len(), 2);

        let desired: HashSet<u32> = [2, 3].into_iter().collect();
        let missing = pool.update_backend_list(&desired);
        assert_eq!(missing, vec![3]);
        assert!(pool.get_backend(1).is_none());
        assert!(pool.get_backend(2).is_some());
    }

    #[test]
    fn occupancy_freshness_window() {
        let client = BackupClient::new(info(7));
        assert!(client.fresh_occupancy(Duration::from_millis(10)).is_none());
        client.report_occupancy(0.4);
        assert_eq!(client.fresh_occupancy(Duration::from_secs(10)), Some(0.4));
        assert!(client.fresh_occupancy(Duration::from_nanos(0)).is_none());
    }
}
