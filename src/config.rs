use crate::errors::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration containing identity and network settings.
///
/// Serialized to TOML and saved at `~/.spindle/node.toml`. Every field has
/// a default so a partial file (or none at all) still yields a runnable
/// node; `generate-config` persists the defaults for editing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity broadcast in discovery. Stable across restarts once the
    /// config file is saved.
    pub node_id: String,

    /// Address the inbound RPC server binds to.
    pub bind_addr: String,

    /// Inbound RPC port. 0 binds an ephemeral port (tests). Broadcast to
    /// peers under the `grpc_port` wire key.
    pub rpc_port: u16,

    /// UDP discovery port.
    pub discovery_port: u16,

    /// Discovery broadcast period.
    pub broadcast_interval_ms: u64,

    /// A peer unheard-from for longer than this is considered dead.
    pub peer_timeout_ms: u64,

    /// How often the reaper sweeps the peer map.
    pub reaper_interval_ms: u64,

    /// How often the cached topology snapshot is refreshed.
    pub topology_interval_ms: u64,

    /// Outbound RPC keep-alive ping period.
    pub rpc_keepalive_ms: u64,

    /// Per-call RPC deadline.
    pub rpc_call_deadline_ms: u64,

    /// Maximum length-framed message size, enforced on read and write.
    pub max_message_bytes: usize,

    /// Whether UDP broadcast discovery runs. Clusters on networks without
    /// broadcast reachability can disable it and rely on `static_peers`.
    pub enable_discovery: bool,

    /// Peers dialed at startup, `"<node_id>@<host>:<port>"` each.
    pub static_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: generate_node_id(),
            bind_addr: "0.0.0.0".to_string(),
            rpc_port: 50051,
            discovery_port: 5678,
            broadcast_interval_ms: 2500,
            peer_timeout_ms: 10_000,
            reaper_interval_ms: 5_000,
            topology_interval_ms: 5_000,
            rpc_keepalive_ms: 10_000,
            rpc_call_deadline_ms: 30_000,
            max_message_bytes: 256 * 1024 * 1024,
            enable_discovery: true,
            static_peers: Vec::new(),
        }
    }
}

/// Generate a fresh node identity: `node-<8 hex chars>`.
fn generate_node_id() -> String {
    format!("node-{:08x}", rand::random::<u32>())
}

impl NodeConfig {
    /// Get default configuration file path: `~/.spindle/node.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| NodeError::Config("could not determine home directory".to_string()))?;
        Ok(home.join(".spindle").join("node.toml"))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check the invariants a running node relies on.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(NodeError::Config("node_id must not be empty".to_string()));
        }
        if self.node_id.len() > 256 {
            return Err(NodeError::Config(
                "node_id must be at most 256 bytes".to_string(),
            ));
        }
        if self.broadcast_interval_ms == 0 || self.reaper_interval_ms == 0 {
            return Err(NodeError::Config(
                "discovery intervals must be non-zero".to_string(),
            ));
        }
        if self.peer_timeout_ms < self.broadcast_interval_ms {
            return Err(NodeError::Config(
                "peer_timeout_ms must be at least broadcast_interval_ms".to_string(),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(NodeError::Config(
                "max_message_bytes must be non-zero".to_string(),
            ));
        }
        for entry in &self.static_peers {
            parse_static_peer(entry)?;
        }
        Ok(())
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn topology_interval(&self) -> Duration {
        Duration::from_millis(self.topology_interval_ms)
    }

    pub fn rpc_keepalive(&self) -> Duration {
        Duration::from_millis(self.rpc_keepalive_ms)
    }

    pub fn rpc_call_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_call_deadline_ms)
    }
}

/// Parse a `"<node_id>@<host>:<port>"` static peer entry.
pub fn parse_static_peer(entry: &str) -> Result<(String, std::net::SocketAddr)> {
    let (id, addr) = entry
        .split_once('@')
        .ok_or_else(|| NodeError::Config(format!("static peer '{}' missing '@'", entry)))?;
    if id.is_empty() {
        return Err(NodeError::Config(format!(
            "static peer '{}' has empty node id",
            entry
        )));
    }
    let addr = addr
        .parse()
        .map_err(|e| NodeError::Config(format!("static peer '{}': {}", entry, e)))?;
    Ok((id.to_string(), addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.rpc_port, 50051);
        assert_eq!(config.discovery_port, 5678);
        assert_eq!(config.broadcast_interval_ms, 2500);
        assert_eq!(config.peer_timeout_ms, 10_000);
        assert_eq!(config.max_message_bytes, 256 * 1024 * 1024);
        assert!(config.node_id.starts_with("node-"));
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");

        let config = NodeConfig::default();
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.node_id, config.node_id);
        assert_eq!(loaded.rpc_port, config.rpc_port);
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "rpc_port = 9000\n").unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.rpc_port, 9000);
        assert_eq!(loaded.discovery_port, 5678);
    }

    #[test]
    fn test_validate_rejects_bad_timeouts() {
        let config = NodeConfig {
            peer_timeout_ms: 100,
            broadcast_interval_ms: 2500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_static_peer() {
        let (id, addr) = parse_static_peer("node-a@127.0.0.1:50051").unwrap();
        assert_eq!(id, "node-a");
        assert_eq!(addr.port(), 50051);

        assert!(parse_static_peer("no-at-sign").is_err());
        assert!(parse_static_peer("@127.0.0.1:1").is_err());
        assert!(parse_static_peer("id@notanaddr").is_err());
    }
}
