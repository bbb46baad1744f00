//! Discovery service behavior over real UDP sockets on loopback.

use spindle::config::NodeConfig;
use spindle::discovery::{Announcement, DiscoveryService};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

fn test_config(node_id: &str, discovery_port: u16) -> NodeConfig {
    NodeConfig {
        node_id: node_id.to_string(),
        discovery_port,
        broadcast_interval_ms: 200,
        peer_timeout_ms: 600,
        reaper_interval_ms: 100,
        enable_discovery: true,
        ..Default::default()
    }
}

fn random_port() -> u16 {
    20_000 + (rand::random::<u16>() % 20_000)
}

async fn send_to(port: u16, payload: &[u8]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(payload, ("127.0.0.1", port))
        .await
        .unwrap();
}

#[tokio::test]
async fn listener_upserts_announced_peer() {
    let port = random_port();
    let service = DiscoveryService::new(&test_config("me", port), 50051);
    service.start().await.unwrap();
    let mut changes = service.subscribe();

    let announcement = serde_json::to_vec(&Announcement::new("other", 9001)).unwrap();
    send_to(port, &announcement).await;

    let snapshot = timeout(Duration::from_secs(2), changes.recv())
        .await
        .expect("no change within 2s")
        .unwrap();
    let peer = &snapshot["other"];
    assert_eq!(peer.port, 9001);
    assert_eq!(peer.address, "127.0.0.1".parse::<std::net::IpAddr>().unwrap());

    service.stop().await;
}

#[tokio::test]
async fn listener_accepts_legacy_payload() {
    let port = random_port();
    let service = DiscoveryService::new(&test_config("me", port), 50051);
    service.start().await.unwrap();
    let mut changes = service.subscribe();

    send_to(port, b"old-style:7654").await;

    let snapshot = timeout(Duration::from_secs(2), changes.recv())
        .await
        .expect("no change within 2s")
        .unwrap();
    assert_eq!(snapshot["old-style"].port, 7654);

    service.stop().await;
}

#[tokio::test]
async fn own_announcements_never_enter_the_pool() {
    let port = random_port();
    let service = DiscoveryService::new(&test_config("self-node", port), 50051);
    service.start().await.unwrap();

    let announcement = serde_json::to_vec(&Announcement::new("self-node", 50051)).unwrap();
    send_to(port, &announcement).await;

    sleep(Duration::from_millis(300)).await;
    assert!(service.peers().await.is_empty());

    service.stop().await;
}

#[tokio::test]
async fn garbage_datagrams_are_dropped() {
    let port = random_port();
    let service = DiscoveryService::new(&test_config("me", port), 50051);
    service.start().await.unwrap();

    send_to(port, b"not a discovery message").await;
    send_to(port, &[0xFF, 0x00, 0xFF]).await;

    sleep(Duration::from_millis(300)).await;
    assert!(service.peers().await.is_empty());

    service.stop().await;
}

#[tokio::test]
async fn silent_peer_is_reaped() {
    let port = random_port();
    let service = DiscoveryService::new(&test_config("me", port), 50051);
    service.start().await.unwrap();

    let announcement = serde_json::to_vec(&Announcement::new("transient", 9001)).unwrap();
    send_to(port, &announcement).await;

    // present shortly after the announcement
    sleep(Duration::from_millis(200)).await;
    assert!(service.peers().await.contains_key("transient"));

    // gone within peer_timeout + reaper_interval
    sleep(Duration::from_millis(900)).await;
    assert!(!service.peers().await.contains_key("transient"));

    service.stop().await;
}

#[tokio::test]
async fn repeated_announcements_keep_one_entry() {
    let port = random_port();
    let service = DiscoveryService::new(&test_config("me", port), 50051);
    service.start().await.unwrap();

    let announcement = serde_json::to_vec(&Announcement::new("steady", 9001)).unwrap();
    for _ in 0..5 {
        send_to(port, &announcement).await;
        sleep(Duration::from_millis(50)).await;
    }

    let peers = service.peers().await;
    assert_eq!(peers.len(), 1);
    assert!(peers.contains_key("steady"));

    service.stop().await;
}

#[tokio::test]
async fn stop_clears_peers_and_is_idempotent() {
    let port = random_port();
    let service = DiscoveryService::new(&test_config("me", port), 50051);
    service.start().await.unwrap();
    // start is idempotent too
    service.start().await.unwrap();

    let announcement = serde_json::to_vec(&Announcement::new("other", 9001)).unwrap();
    send_to(port, &announcement).await;
    sleep(Duration::from_millis(200)).await;
    assert!(!service.peers().await.is_empty());

    service.stop().await;
    assert!(service.peers().await.is_empty());
    service.stop().await;
}
