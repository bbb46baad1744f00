//! UDP broadcast peer discovery with liveness tracking.
//!
//! Three cooperative tasks share one broadcast-enabled socket bound to
//! the discovery port: a broadcaster announcing this node, a listener
//! upserting peers from received announcements, and a reaper evicting
//! peers that stopped announcing. Subscribers get the full peer map on
//! every mutation.

mod announce;

pub use announce::{parse_datagram, Announcement, PeerInfo};

use crate::config::NodeConfig;
use crate::errors::Result;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Maximum discovery datagram size.
const MAX_DATAGRAM_BYTES: usize = 1024;

/// Change stream buffer; slow subscribers observe a lag error and should
/// re-read the current map.
const CHANGE_STREAM_CAPACITY: usize = 64;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// State shared by the three discovery tasks.
struct Shared {
    node_id: String,
    peers: RwLock<HashMap<String, PeerInfo>>,
    changes: broadcast::Sender<HashMap<String, PeerInfo>>,
}

impl Shared {
    async fn emit(&self) {
        let snapshot = self.peers.read().await.clone();
        // no receivers is fine
        let _ = self.changes.send(snapshot);
    }

    /// Upsert a peer from a received announcement. Own announcements are
    /// dropped. Returns whether the map changed.
    async fn apply_announcement(&self, ann: &Announcement, source: IpAddr) -> bool {
        if ann.node_id == self.node_id {
            return false;
        }

        let peer = PeerInfo {
            id: ann.node_id.clone(),
            address: source,
            port: ann.grpc_port,
            last_seen_ms: now_ms(),
        };

        let is_new = {
            let mut peers = self.peers.write().await;
            peers.insert(peer.id.clone(), peer.clone()).is_none()
        };

        if is_new {
            info!(peer_id = %peer.id, addr = %peer.rpc_addr(), "peer discovered");
        } else {
            trace!(peer_id = %peer.id, "peer heartbeat");
        }

        self.emit().await;
        true
    }

    /// Evict peers unheard-from for longer than `timeout`. Returns the
    /// number removed.
    async fn reap(&self, timeout: Duration) -> usize {
        let cutoff = now_ms() - timeout.as_millis() as i64;
        let removed: Vec<String> = {
            let mut peers = self.peers.write().await;
            let stale: Vec<String> = peers
                .values()
                .filter(|p| p.last_seen_ms < cutoff)
                .map(|p| p.id.clone())
                .collect();
            for id in &stale {
                peers.remove(id);
            }
            stale
        };

        if !removed.is_empty() {
            for id in &removed {
                info!(peer_id = %id, "peer timed out");
            }
            self.emit().await;
        }
        removed.len()
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Periodic UDP broadcast of this node's identity plus a concurrent
/// listener maintaining the live peer set.
pub struct DiscoveryService {
    shared: Arc<Shared>,
    rpc_port: u16,
    discovery_port: u16,
    broadcast_interval: Duration,
    peer_timeout: Duration,
    reaper_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl DiscoveryService {
    pub fn new(config: &NodeConfig, rpc_port: u16) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                node_id: config.node_id.clone(),
                peers: RwLock::new(HashMap::new()),
                changes,
            }),
            rpc_port,
            discovery_port: config.discovery_port,
            broadcast_interval: config.broadcast_interval(),
            peer_timeout: config.peer_timeout(),
            reaper_interval: config.reaper_interval(),
            running: Mutex::new(None),
        }
    }

    /// Subscribe to the peer map change stream.
    pub fn subscribe(&self) -> broadcast::Receiver<HashMap<String, PeerInfo>> {
        self.shared.changes.subscribe()
    }

    /// Current peer map snapshot.
    pub async fn peers(&self) -> HashMap<String, PeerInfo> {
        self.shared.peers.read().await.clone()
    }

    /// Start the broadcaster, listener and reaper tasks. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let socket = Arc::new(bind_discovery_socket(self.discovery_port)?);
        let cancel = CancellationToken::new();

        info!(
            node_id = %self.shared.node_id,
            discovery_port = self.discovery_port,
            rpc_port = self.rpc_port,
            "discovery started"
        );

        let tasks = vec![
            tokio::spawn(broadcaster_loop(
                socket.clone(),
                Announcement::new(self.shared.node_id.clone(), self.rpc_port),
                self.discovery_port,
                self.broadcast_interval,
                cancel.clone(),
            )),
            tokio::spawn(listener_loop(
                socket.clone(),
                self.shared.clone(),
                cancel.clone(),
            )),
            tokio::spawn(reaper_loop(
                self.shared.clone(),
                self.peer_timeout,
                self.reaper_interval,
                cancel.clone(),
            )),
        ];

        *running = Some(Running { cancel, tasks });
        Ok(())
    }

    /// Cancel all tasks, close the socket and clear the peer map.
    pub async fn stop(&self) {
        let Some(run) = self.running.lock().await.take() else {
            return;
        };
        run.cancel.cancel();
        for task in run.tasks {
            let _ = task.await;
        }
        self.shared.peers.write().await.clear();
        info!(node_id = %self.shared.node_id, "discovery stopped");
    }
}

/// Bind the shared discovery socket with reuse-address and broadcast
/// enabled, via socket2 for pre-bind options.
fn bind_discovery_socket(port: u16) -> std::io::Result<UdpSocket> {
    let addr: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// The generic broadcast address plus the subnet broadcast address of
/// every up, non-loopback IPv4 interface.
fn broadcast_targets(port: u16) -> Vec<SocketAddr> {
    let mut targets = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)];

    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces {
                if iface.is_loopback() {
                    continue;
                }
                if let if_addrs::IfAddr::V4(v4) = iface.addr {
                    let subnet =
                        Ipv4Addr::from(u32::from(v4.ip) | !u32::from(v4.netmask));
                    let target = SocketAddr::new(IpAddr::V4(subnet), port);
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
            }
        }
        Err(e) => {
            debug!(error = %e, "failed to enumerate interfaces");
        }
    }

    targets
}

async fn broadcaster_loop(
    socket: Arc<UdpSocket>,
    announcement: Announcement,
    port: u16,
    period: Duration,
    cancel: CancellationToken,
) {
    let payload = match serde_json::to_vec(&announcement) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "failed to encode announcement");
            return;
        }
    };

    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for target in broadcast_targets(port) {
                    if let Err(e) = socket.send_to(&payload, target).await {
                        // expected on interfaces that refuse broadcast
                        debug!(target = %target, error = %e, "broadcast send failed");
                    }
                }
                trace!(node_id = %announcement.node_id, "announcement broadcast");
            }
        }
    }
}

async fn listener_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, sender)) => match parse_datagram(&buf[..len]) {
                        Ok(ann) => {
                            shared.apply_announcement(&ann, sender.ip()).await;
                        }
                        Err(e) => {
                            debug!(sender = %sender, error = %e, "dropping unparsable datagram");
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "discovery receive failed");
                    }
                }
            }
        }
    }
}

async fn reaper_loop(
    shared: Arc<Shared>,
    timeout: Duration,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                shared.reap(timeout).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(node_id: &str) -> Arc<Shared> {
        let (changes, _) = broadcast::channel(CHANGE_STREAM_CAPACITY);
        Arc::new(Shared {
            node_id: node_id.to_string(),
            peers: RwLock::new(HashMap::new()),
            changes,
        })
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let shared = shared("me");
        let ann = Announcement::new("other", 50051);
        let source: IpAddr = "192.168.1.7".parse().unwrap();

        shared.apply_announcement(&ann, source).await;
        let first_seen = shared.peers.read().await["other"].last_seen_ms;

        tokio::time::sleep(Duration::from_millis(5)).await;
        shared.apply_announcement(&ann, source).await;

        let peers = shared.peers.read().await;
        assert_eq!(peers.len(), 1);
        assert!(peers["other"].last_seen_ms >= first_seen);
    }

    #[tokio::test]
    async fn test_own_announcements_suppressed() {
        let shared = shared("me");
        let ann = Announcement::new("me", 50051);
        let changed = shared
            .apply_announcement(&ann, "127.0.0.1".parse().unwrap())
            .await;
        assert!(!changed);
        assert!(shared.peers.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_reap_evicts_stale_peers() {
        let shared = shared("me");
        {
            let mut peers = shared.peers.write().await;
            peers.insert(
                "stale".to_string(),
                PeerInfo {
                    id: "stale".to_string(),
                    address: "10.0.0.1".parse().unwrap(),
                    port: 1,
                    last_seen_ms: now_ms() - 60_000,
                },
            );
            peers.insert(
                "fresh".to_string(),
                PeerInfo {
                    id: "fresh".to_string(),
                    address: "10.0.0.2".parse().unwrap(),
                    port: 2,
                    last_seen_ms: now_ms(),
                },
            );
        }

        let removed = shared.reap(Duration::from_secs(10)).await;
        assert_eq!(removed, 1);

        let peers = shared.peers.read().await;
        assert!(peers.contains_key("fresh"));
        assert!(!peers.contains_key("stale"));
    }

    #[tokio::test]
    async fn test_change_stream_delivers_snapshots() {
        let shared = shared("me");
        let mut rx = shared.changes.subscribe();

        let ann = Announcement::new("other", 9);
        shared
            .apply_announcement(&ann, "10.0.0.3".parse().unwrap())
            .await;

        let snapshot = rx.recv().await.unwrap();
        assert!(snapshot.contains_key("other"));
    }

    #[test]
    fn test_broadcast_targets_include_limited_broadcast() {
        let targets = broadcast_targets(5678);
        assert!(targets.contains(&"255.255.255.255:5678".parse().unwrap()));
    }
}
