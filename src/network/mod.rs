//! Peer-to-peer transport: connections, handshakes, message dispatch.

pub mod connection;
pub mod protocol;

use crate::document::EntryType;
use crate::error::{DbError, DbResult};
use connection::{Connection, Listener};
use protocol::{MessageType, ProtocolMessage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock as AsyncRwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub shared_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub factor: i32,
    pub strategy: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: 1,
            strategy: "eventual".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscoveryConfig {
    pub mdns: bool,
    pub bootstrap: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: String,
    pub name: String,
    pub collections: HashMap<String, bool>,
    pub bootstrap_peers: Vec<String>,
    pub default_posting_network: String,
    pub auto_post_classifications: Vec<EntryType>,
    pub private_by_default: bool,
    pub encryption: EncryptionConfig,
    pub replication: ReplicationConfig,
    pub discovery: DiscoveryConfig,
}

impl NetworkConfig {
    pub fn new(network_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            name: name.into(),
            collections: HashMap::new(),
            bootstrap_peers: Vec::new(),
            default_posting_network: String::new(),
            auto_post_classifications: vec![EntryType::Audit, EntryType::ThreatEvent, EntryType::Job],
            private_by_default: true,
            encryption: EncryptionConfig::default(),
            replication: ReplicationConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub addrs: Vec<String>,
    pub protocols: Vec<String>,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub collections: Vec<String>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkStats {
    pub network_id: String,
    pub connected_peers: i32,
    pub total_peers: i32,
    pub collections_shared: i32,
    pub operations_sent: i64,
    pub operations_received: i64,
    pub bytes_transferred: i64,
    #[serde(with = "duration_millis")]
    pub average_latency: Duration,
}

type Handler = Arc<dyn Fn(ProtocolMessage) + Send + Sync>;

struct SharedState {
    networks: HashMap<String, NetworkConfig>,
    peers: HashMap<String, PeerInfo>,
    connections: HashMap<String, Arc<AsyncMutex<Connection>>>,
    handlers: HashMap<MessageType, Vec<Handler>>,
    stats: HashMap<String, NetworkStats>,
}

/// Owns peer connections, handshakes, and message dispatch for every
/// network this node has joined.
pub struct NetworkManager {
    local_peer_id: String,
    state: AsyncRwLock<SharedState>,
    listener: AsyncMutex<Option<Arc<Listener>>>,
    accept_task: AsyncMutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NetworkManager {
    pub fn new(local_peer_id: impl Into<String>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            local_peer_id: local_peer_id.into(),
            state: AsyncRwLock::new(SharedState {
                networks: HashMap::new(),
                peers: HashMap::new(),
                connections: HashMap::new(),
                handlers: HashMap::new(),
                stats: HashMap::new(),
            }),
            listener: AsyncMutex::new(None),
            accept_task: AsyncMutex::new(None),
            shutdown_tx,
        }
    }

    /// Binds `bind_addr` and spawns the accept loop: every inbound stream
    /// gets its own handshake and its own dispatch task, same shape as a
    /// dialed connection.
    pub async fn initialize(self: &Arc<Self>, bind_addr: &str) -> DbResult<()> {
        let listener = Arc::new(Listener::bind(bind_addr).await?);
        *self.listener.lock().await = Some(listener.clone());

        let manager = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok(stream) => {
                                let manager = manager.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = manager.handle_inbound(stream).await {
                                        warn!(error = %e, "inbound connection failed");
                                    }
                                });
                            }
                            Err(e) => warn!(error = %e, "accept failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        *self.accept_task.lock().await = Some(handle);
        Ok(())
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream) -> DbResult<()> {
        let connection = Connection::accept(stream, &self.local_peer_id).await?;
        let peer_id = connection.peer_id().to_string();
        let handle = self.register_connection(peer_id.clone(), connection).await;
        debug!(peer = %peer_id, "inbound handshake complete");
        self.run_receive_loop(&peer_id, handle).await;
        Ok(())
    }

    /// Dials `addr`, completes the handshake as the connecting side, and
    /// runs the same receive-and-dispatch loop as an inbound connection.
    async fn dial(self: Arc<Self>, addr: &str) -> DbResult<()> {
        let stream = TcpStream::connect(addr).await?;
        let connection = Connection::connect(stream, &self.local_peer_id).await?;
        let peer_id = connection.peer_id().to_string();
        let handle = self.register_connection(peer_id.clone(), connection).await;
        debug!(peer = %peer_id, addr, "dialed bootstrap peer");
        self.run_receive_loop(&peer_id, handle).await;
        Ok(())
    }

    async fn run_receive_loop(&self, peer_id: &str, connection: Arc<AsyncMutex<Connection>>) {
        loop {
            let received = connection.lock().await.receive().await;
            match received {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer_id, error = %e, "connection receive failed");
                    break;
                }
            }
        }
        self.drop_connection(peer_id).await;
    }

    pub async fn create_network(&self, config: NetworkConfig) -> DbResult<()> {
        let mut state = self.state.write().await;
        state.stats.insert(
            config.network_id.clone(),
            NetworkStats {
                network_id: config.network_id.clone(),
                ..Default::default()
            },
        );
        state.networks.insert(config.network_id.clone(), config);
        Ok(())
    }

    /// Records `bootstrap` on the network's peer list and spawns one dial
    /// task per address; each dialed peer is registered and dispatched
    /// exactly like an inbound connection.
    pub async fn join_network(self: &Arc<Self>, network_id: &str, bootstrap: Vec<String>) -> DbResult<()> {
        {
            let mut state = self.state.write().await;
            let network = state
                .networks
                .get_mut(network_id)
                .ok_or_else(|| DbError::not_initialized(format!("network '{network_id}'")))?;
            network.bootstrap_peers.extend(bootstrap.clone());
        }

        for addr in bootstrap {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.dial(&addr).await {
                    warn!(addr = %addr, error = %e, "failed to dial bootstrap peer");
                }
            });
        }
        Ok(())
    }

    pub async fn leave_network(&self, network_id: &str) -> DbResult<()> {
        let mut state = self.state.write().await;
        state.networks.remove(network_id);
        state.stats.remove(network_id);
        Ok(())
    }

    pub async fn add_collection_to_network(&self, network_id: &str, collection: &str) -> DbResult<()> {
        let mut state = self.state.write().await;
        let network = state
            .networks
            .get_mut(network_id)
            .ok_or_else(|| DbError::not_initialized(format!("network '{network_id}'")))?;
        network.collections.insert(collection.to_string(), true);
        Ok(())
    }

    pub async fn remove_collection_from_network(&self, network_id: &str, collection: &str) -> DbResult<()> {
        let mut state = self.state.write().await;
        if let Some(network) = state.networks.get_mut(network_id) {
            network.collections.remove(collection);
        }
        Ok(())
    }

    pub async fn register_connection(&self, peer_id: String, connection: Connection) -> Arc<AsyncMutex<Connection>> {
        let handle = Arc::new(AsyncMutex::new(connection));
        let mut state = self.state.write().await;
        state.connections.insert(peer_id, handle.clone());
        handle
    }

    pub async fn drop_connection(&self, peer_id: &str) {
        let mut state = self.state.write().await;
        state.connections.remove(peer_id);
    }

    pub async fn broadcast_message(&self, network_id: &str, message: ProtocolMessage) -> DbResult<()> {
        let connections: Vec<Arc<AsyncMutex<Connection>>> = {
            let state = self.state.read().await;
            state.connections.values().cloned().collect()
        };

        let mut sent_bytes: i64 = 0;
        for conn in connections {
            let mut guard = conn.lock().await;
            match guard.send(&message).await {
                Ok(n) => sent_bytes += n as i64,
                Err(e) => warn!(peer = guard.peer_id(), error = %e, "failed to send broadcast message"),
            }
        }

        let mut state = self.state.write().await;
        if let Some(stats) = state.stats.get_mut(network_id) {
            stats.operations_sent += 1;
            stats.bytes_transferred += sent_bytes;
        }
        Ok(())
    }

    pub async fn send_to_peer(&self, peer_id: &str, network_id: &str, message: ProtocolMessage) -> DbResult<()> {
        let conn = {
            let state = self.state.read().await;
            state
                .connections
                .get(peer_id)
                .cloned()
                .ok_or_else(|| DbError::PeerUnknown { peer_id: peer_id.to_string() })?
        };
        let sent = {
            let mut guard = conn.lock().await;
            guard.send(&message).await?
        };

        let mut state = self.state.write().await;
        if let Some(stats) = state.stats.get_mut(network_id) {
            stats.operations_sent += 1;
            stats.bytes_transferred += sent as i64;
        }
        Ok(())
    }

    pub async fn on_message(&self, msg_type: MessageType, handler: Handler) {
        let mut state = self.state.write().await;
        state.handlers.entry(msg_type).or_default().push(handler);
    }

    pub async fn dispatch(&self, message: ProtocolMessage) {
        let handlers: Vec<Handler> = {
            let state = self.state.read().await;
            state.handlers.get(&message.msg_type).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            debug!(msg_type = %message.msg_type, "no handler registered, ignoring message");
        }
        for handler in handlers {
            handler(message.clone());
        }
    }

    pub async fn get_network_stats(&self, network_id: &str) -> Option<NetworkStats> {
        self.state.read().await.stats.get(network_id).cloned()
    }

    /// The entry-type classifications that auto-stage writes for external
    /// posting on `network_id`. Empty if the network is unknown.
    pub async fn auto_post_classifications(&self, network_id: &str) -> Vec<EntryType> {
        self.state
            .read()
            .await
            .networks
            .get(network_id)
            .map(|n| n.auto_post_classifications.clone())
            .unwrap_or_default()
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }
        let mut state = self.state.write().await;
        state.connections.clear();
        state.networks.clear();
        *self.listener.lock().await = None;
    }
}
