//! Peer transport for talking to attestation workers (iroh).
//!
//! Two protocols are involved:
//!
//! - `bucket/idle-request`: outbound. The node asks a worker for one filler
//!   file and gets a short `OK` / `ERROR: ...` acknowledgement.
//! - `bucket/idle-delivery`: inbound. The worker later pushes the data file
//!   and its tag, each on its own stream framed as
//!   `[DELIVERY_MAGIC][u32 LE header_len][JSON DeliveryHeader][raw bytes]`.
//!   Completed files are announced on the data-ready and tag-ready channels
//!   consumed by the idle acquisition loop.

use crate::error::TransportError;
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{DELIVERY_MAGIC, DeliveryHeader, DeliveryKind, IdleFileRequest, MAX_DELIVERY_HEADER};
use dashmap::DashMap;
use iroh::endpoint::Connection;
use iroh::protocol::Router;
use iroh::{Endpoint, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// ALPN for filler file requests sent to workers.
pub const IDLE_REQUEST_ALPN: &[u8] = b"bucket/idle-request";

/// ALPN on which workers push filler files back.
pub const IDLE_DELIVERY_ALPN: &[u8] = b"bucket/idle-delivery";

/// Timeout for connecting and for the request acknowledgement.
const P2P_TIMEOUT_SECS: u64 = 30;

/// Timeout for reading a delivery header.
const HEADER_READ_TIMEOUT_SECS: u64 = 30;

/// Timeout for reading a delivery body.
const DATA_READ_TIMEOUT_SECS: u64 = 120;

/// Maximum size of a tag file.
const MAX_TAG_SIZE: u64 = 4 * 1024 * 1024;

/// Capacity of each delivery channel.
pub const DELIVERY_CHANNEL_CAPACITY: usize = 16;

/// Where a worker can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub peer_id: String,
    #[serde(default)]
    pub direct_addrs: Vec<SocketAddr>,
    #[serde(default)]
    pub relay_url: Option<String>,
}

impl PeerAddr {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            direct_addrs: Vec::new(),
            relay_url: None,
        }
    }
}

/// Resolved worker addresses, checked before a distributed lookup.
#[derive(Debug, Default)]
pub struct PeerCache {
    peers: DashMap<String, PeerAddr>,
}

impl PeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerAddr> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    pub fn insert(&self, addr: PeerAddr) {
        self.peers.insert(addr.peer_id.clone(), addr);
    }

    pub fn remove(&self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// This node's network identity, as workers address it.
    fn local_peer_id(&self) -> String;

    /// Distributed lookup of a worker's address.
    async fn find_peer(&self, peer_id: &str) -> Result<PeerAddr, TransportError>;

    async fn connect(&self, addr: &PeerAddr) -> Result<(), TransportError>;

    /// Ask a connected worker for one filler file. Success means the worker
    /// accepted; the files themselves arrive on the delivery channels.
    async fn send_fetch_request(
        &self,
        addr: &PeerAddr,
        request: &IdleFileRequest,
    ) -> Result<(), TransportError>;

    /// Stop accepting deliveries for an earlier request to `peer_id`.
    fn release_request(&self, peer_id: &str);
}

/// Sending half of the delivery channels, held by whoever writes files.
#[derive(Debug, Clone)]
pub struct DeliverySenders {
    pub data: mpsc::Sender<PathBuf>,
    pub tag: mpsc::Sender<PathBuf>,
}

/// Receiving half of the delivery channels, owned by the acquisition loop.
#[derive(Debug)]
pub struct IdleDeliveries {
    pub data: mpsc::Receiver<PathBuf>,
    pub tag: mpsc::Receiver<PathBuf>,
}

impl IdleDeliveries {
    /// Drain anything left over from an earlier attempt.
    pub fn drain_stale(&mut self) -> Vec<PathBuf> {
        let mut stale = Vec::new();
        while let Ok(p) = self.data.try_recv() {
            stale.push(p);
        }
        while let Ok(p) = self.tag.try_recv() {
            stale.push(p);
        }
        stale
    }
}

/// Create a connected pair of delivery channels.
pub fn delivery_channels(capacity: usize) -> (DeliverySenders, IdleDeliveries) {
    let (data_tx, data_rx) = mpsc::channel(capacity);
    let (tag_tx, tag_rx) = mpsc::channel(capacity);
    (
        DeliverySenders {
            data: data_tx,
            tag: tag_tx,
        },
        IdleDeliveries {
            data: data_rx,
            tag: tag_rx,
        },
    )
}

/// Write a delivered file under `<root>/tmp`.
///
/// The file is written as `.part`, synced, then renamed to `<name>` (data) or
/// `<name>.tag` (tag), so a path announced on a channel always names a
/// complete file. Nothing under `idle/` is touched until the acquisition loop
/// has admitted the pair.
pub async fn store_delivery(
    workspace: &Workspace,
    header: &DeliveryHeader,
    bytes: &[u8],
) -> std::io::Result<PathBuf> {
    let (final_path, suffix) = match header.kind {
        DeliveryKind::Data => (workspace.tmp_dir().join(&header.name), "data"),
        DeliveryKind::Tag => (
            workspace
                .tmp_dir()
                .join(format!("{}.{}", header.name, common::TAG_EXTENSION)),
            "tag",
        ),
    };
    let tmp_path = workspace
        .tmp_dir()
        .join(format!("{}.{}.part", header.name, suffix));

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
        crate::workspace::remove_quietly(&tmp_path).await;
        return Err(e);
    }
    Ok(final_path)
}

/// Protocol handler for inbound filler deliveries.
///
/// Only accepts connections from workers this node has sent a request to.
#[derive(Debug, Clone)]
pub struct IdleDeliveryHandler {
    pub workspace: Workspace,
    pub senders: DeliverySenders,
    pub expected: Arc<DashMap<PublicKey, u64>>,
    pub max_data_len: u64,
}

impl iroh::protocol::ProtocolHandler for IdleDeliveryHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl futures::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        trace!(remote = %conn.remote_id(), "IdleDeliveryHandler::accept called");
        let handler = self.clone();
        async move {
            handle_delivery_connection(conn, handler)
                .await
                .map_err(|e| iroh::protocol::AcceptError::from_err(std::io::Error::other(e)))
        }
    }
}

async fn handle_delivery_connection(
    connection: Connection,
    handler: IdleDeliveryHandler,
) -> Result<()> {
    let remote = connection.remote_id();
    if !handler.expected.contains_key(&remote) {
        warn!(remote = %remote, "Rejecting delivery from peer we did not ask");
        connection.close(1u32.into(), b"unexpected peer");
        return Ok(());
    }

    loop {
        let (mut send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                trace!(remote = %remote, error = %e, "Connection closed");
                break;
            }
        };

        if !handler.expected.contains_key(&remote) {
            debug!(remote = %remote, "Request released, closing delivery connection");
            connection.close(1u32.into(), b"request released");
            break;
        }

        let handler = handler.clone();
        tokio::spawn(async move {
            let reply: Vec<u8> = match handle_delivery_stream(recv, &handler).await {
                Ok(path) => {
                    info!(remote = %remote, path = %path.display(), "Delivery stored");
                    b"OK".to_vec()
                }
                Err(e) => {
                    warn!(remote = %remote, error = %e, "Delivery failed");
                    format!("ERROR: {}", e).into_bytes()
                }
            };
            if let Err(e) = send.write_all(&reply).await {
                debug!(error = %e, "Failed to write delivery reply");
            }
            let _ = send.finish();
        });
    }

    Ok(())
}

async fn handle_delivery_stream(
    mut recv: iroh::endpoint::RecvStream,
    handler: &IdleDeliveryHandler,
) -> Result<PathBuf> {
    let header_timeout = Duration::from_secs(HEADER_READ_TIMEOUT_SECS);
    let data_timeout = Duration::from_secs(DATA_READ_TIMEOUT_SECS);

    let mut magic = [0u8; 1];
    tokio::time::timeout(header_timeout, recv.read_exact(&mut magic))
        .await
        .map_err(|_| anyhow::anyhow!("magic byte read timed out"))?
        .map_err(|e| anyhow::anyhow!("magic byte read failed: {}", e))?;
    if magic[0] != DELIVERY_MAGIC {
        anyhow::bail!("bad delivery magic 0x{:02x}", magic[0]);
    }

    let mut len_bytes = [0u8; 4];
    tokio::time::timeout(header_timeout, recv.read_exact(&mut len_bytes))
        .await
        .map_err(|_| anyhow::anyhow!("header length read timed out"))?
        .map_err(|e| anyhow::anyhow!("header length read failed: {}", e))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if header_len > MAX_DELIVERY_HEADER {
        anyhow::bail!("delivery header too large: {} bytes", header_len);
    }

    let mut header_bytes = vec![0u8; header_len];
    tokio::time::timeout(header_timeout, recv.read_exact(&mut header_bytes))
        .await
        .map_err(|_| anyhow::anyhow!("header read timed out"))?
        .map_err(|e| anyhow::anyhow!("header read failed: {}", e))?;
    let header: DeliveryHeader = serde_json::from_slice(&header_bytes)?;

    if !common::is_valid_file_hash(&header.name) {
        anyhow::bail!("invalid file name {:?}", header.name);
    }
    let limit = match header.kind {
        DeliveryKind::Data => handler.max_data_len,
        DeliveryKind::Tag => MAX_TAG_SIZE,
    };
    if header.len == 0 || header.len > limit {
        anyhow::bail!("delivery length {} outside 1..={}", header.len, limit);
    }

    let mut data = vec![0u8; header.len as usize];
    tokio::time::timeout(data_timeout, recv.read_exact(&mut data))
        .await
        .map_err(|_| anyhow::anyhow!("data read timed out"))?
        .map_err(|e| anyhow::anyhow!("data read failed: {}", e))?;

    let path = store_delivery(&handler.workspace, &header, &data).await?;
    let tx = match header.kind {
        DeliveryKind::Data => &handler.senders.data,
        DeliveryKind::Tag => &handler.senders.tag,
    };
    tx.send(path.clone())
        .await
        .map_err(|_| anyhow::anyhow!("acquisition loop is not listening"))?;
    Ok(path)
}

/// Load or generate the p2p secret key so the node ID is stable across restarts.
pub async fn load_p2p_keypair(data_dir: &Path) -> Result<SecretKey> {
    let keypair_path = data_dir.join("p2p_keypair.bin");

    if keypair_path.exists() {
        let bytes = tokio::fs::read(&keypair_path)
            .await
            .context("Failed to read P2P keypair file")?;
        if let Ok(key) = SecretKey::try_from(&bytes[..]) {
            info!(path = ?keypair_path, "Loaded existing P2P keypair");
            return Ok(key);
        }
        warn!(path = ?keypair_path, "Invalid P2P keypair file, generating new one");
    }

    let (secret_key, key_bytes) = {
        let mut rng = rand::rng();
        let key = SecretKey::generate(&mut rng);
        let bytes = key.to_bytes();
        (key, bytes)
    };

    tokio::fs::write(&keypair_path, key_bytes)
        .await
        .context("Failed to save P2P keypair")?;

    info!(path = ?keypair_path, "Generated and saved new P2P keypair");
    Ok(secret_key)
}

/// Peer transport backed by an iroh endpoint.
pub struct IrohTransport {
    endpoint: Endpoint,
    router: Router,
    connections: DashMap<String, Connection>,
    expected: Arc<DashMap<PublicKey, u64>>,
    relay_url: Option<iroh_base::RelayUrl>,
}

impl IrohTransport {
    /// Bind the endpoint and start accepting deliveries.
    pub async fn bind(
        p2p_port: u16,
        relay_url: Option<&str>,
        workspace: Workspace,
        senders: DeliverySenders,
        max_data_len: u64,
    ) -> Result<Self> {
        let secret_key = load_p2p_keypair(workspace.root()).await?;

        let relay_url = common::get_relay_url(relay_url);
        info!(relay_url = ?relay_url.as_ref().map(|u| u.to_string()), "Configuring relay");

        let mut transport_config = iroh::endpoint::TransportConfig::default();
        transport_config.keep_alive_interval(Some(Duration::from_secs(15)));
        if let Ok(idle_timeout) = Duration::from_secs(120).try_into() {
            transport_config.max_idle_timeout(Some(idle_timeout));
        }

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .bind_addr_v4(std::net::SocketAddrV4::new(
                std::net::Ipv4Addr::UNSPECIFIED,
                p2p_port,
            ))
            .transport_config(transport_config)
            .relay_mode(common::build_relay_mode(relay_url.as_ref()))
            .bind()
            .await
            .context("Failed to bind Iroh endpoint")?;

        let node_id = endpoint.secret_key().public();
        info!(node_id = %node_id, port = p2p_port, "Iroh endpoint bound");

        let node_id_path = workspace.root().join("node_id.txt");
        if let Err(e) = tokio::fs::write(&node_id_path, node_id.to_string()).await {
            warn!(error = %e, "Failed to write node_id.txt");
        }

        let expected = Arc::new(DashMap::new());
        let handler = IdleDeliveryHandler {
            workspace,
            senders,
            expected: expected.clone(),
            max_data_len,
        };
        let router = Router::builder(endpoint.clone())
            .accept(IDLE_DELIVERY_ALPN, handler)
            .spawn();

        Ok(Self {
            endpoint,
            router,
            connections: DashMap::new(),
            expected,
            relay_url,
        })
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.router.shutdown().await {
            warn!(error = %e, "Router shutdown failed");
        }
    }

    fn endpoint_addr(addr: &PeerAddr) -> Result<iroh::EndpointAddr, TransportError> {
        let id: PublicKey = addr
            .peer_id
            .parse()
            .map_err(|e| TransportError::Lookup(format!("bad peer id {}: {}", addr.peer_id, e)))?;
        let mut endpoint_addr = iroh::EndpointAddr::new(id);
        if !addr.direct_addrs.is_empty() {
            endpoint_addr = endpoint_addr
                .with_addrs(addr.direct_addrs.iter().map(|a| iroh::TransportAddr::Ip(*a)));
        }
        if let Some(url) = addr.relay_url.as_deref().and_then(|u| u.parse().ok()) {
            endpoint_addr = endpoint_addr.with_relay_url(url);
        }
        Ok(endpoint_addr)
    }
}

#[async_trait]
impl PeerTransport for IrohTransport {
    fn local_peer_id(&self) -> String {
        self.endpoint.secret_key().public().to_string()
    }

    async fn find_peer(&self, peer_id: &str) -> Result<PeerAddr, TransportError> {
        // Address discovery is done by the endpoint's lookup services; the
        // node ID plus our relay is enough to dial.
        let _: PublicKey = peer_id
            .parse()
            .map_err(|e| TransportError::Lookup(format!("bad peer id {}: {}", peer_id, e)))?;
        Ok(PeerAddr {
            peer_id: peer_id.to_string(),
            direct_addrs: Vec::new(),
            relay_url: self.relay_url.as_ref().map(|u| u.to_string()),
        })
    }

    async fn connect(&self, addr: &PeerAddr) -> Result<(), TransportError> {
        if let Some(conn) = self.connections.get(&addr.peer_id)
            && conn.close_reason().is_none()
        {
            return Ok(());
        }

        let endpoint_addr = Self::endpoint_addr(addr)?;
        let conn = tokio::time::timeout(
            Duration::from_secs(P2P_TIMEOUT_SECS),
            self.endpoint.connect(endpoint_addr, IDLE_REQUEST_ALPN),
        )
        .await
        .map_err(|_| TransportError::Connect(format!("timeout connecting to {}", addr.peer_id)))?
        .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!(peer = %addr.peer_id, "Connected to attestation worker");
        self.connections.insert(addr.peer_id.clone(), conn);
        Ok(())
    }

    async fn send_fetch_request(
        &self,
        addr: &PeerAddr,
        request: &IdleFileRequest,
    ) -> Result<(), TransportError> {
        self.connect(addr).await?;
        let conn = self
            .connections
            .get(&addr.peer_id)
            .map(|c| c.clone())
            .ok_or_else(|| TransportError::Connect(format!("no connection to {}", addr.peer_id)))?;

        // Register before sending: the worker may start pushing before its
        // acknowledgement reaches us.
        let worker_id = addr.peer_id.parse::<PublicKey>().ok();
        if let Some(id) = worker_id {
            self.expected.insert(id, common::now_secs());
        }

        let result = async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| TransportError::Request(format!("open stream: {}", e)))?;
            let body = serde_json::to_vec(request)
                .map_err(|e| TransportError::Request(format!("encode: {}", e)))?;
            send.write_all(&body)
                .await
                .map_err(|e| TransportError::Request(format!("write: {}", e)))?;
            send.finish()
                .map_err(|e| TransportError::Request(format!("finish: {}", e)))?;

            let reply = tokio::time::timeout(
                Duration::from_secs(P2P_TIMEOUT_SECS),
                recv.read_to_end(1024),
            )
            .await
            .map_err(|_| TransportError::Request("acknowledgement timed out".to_string()))?
            .map_err(|e| TransportError::Request(format!("read: {}", e)))?;

            if reply == b"OK" {
                Ok(())
            } else {
                Err(TransportError::Request(
                    String::from_utf8_lossy(&reply).into_owned(),
                ))
            }
        }
        .await;

        if result.is_err() {
            self.connections.remove(&addr.peer_id);
            self.release_request(&addr.peer_id);
        }
        result
    }

    fn release_request(&self, peer_id: &str) {
        if let Ok(id) = peer_id.parse::<PublicKey>() {
            self.expected.remove(&id);
        }
    }
}
