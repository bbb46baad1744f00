use crate::errors::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Discovery datagram payload.
///
/// Decoding is lenient: unknown keys are ignored so newer peers can add
/// fields without breaking older ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(rename = "type", default = "discovery_type")]
    pub kind: String,

    pub node_id: String,

    /// Inbound RPC port the sender accepts connections on. The key is
    /// kept for wire compatibility with earlier releases.
    pub grpc_port: u16,
}

fn discovery_type() -> String {
    "discovery".to_string()
}

impl Announcement {
    pub fn new(node_id: impl Into<String>, rpc_port: u16) -> Self {
        Self {
            kind: discovery_type(),
            node_id: node_id.into(),
            grpc_port: rpc_port,
        }
    }
}

/// Parse a received datagram: JSON when it starts with `{`, otherwise the
/// legacy bare `<node_id>:<port>` form.
pub fn parse_datagram(payload: &[u8]) -> Result<Announcement> {
    if payload.first() == Some(&b'{') {
        let ann: Announcement = serde_json::from_slice(payload)?;
        if ann.kind != "discovery" {
            return Err(NodeError::MalformedRequest(format!(
                "unexpected discovery message type '{}'",
                ann.kind
            )));
        }
        if ann.node_id.is_empty() {
            return Err(NodeError::MalformedRequest(
                "discovery message with empty node_id".to_string(),
            ));
        }
        return Ok(ann);
    }

    let text = std::str::from_utf8(payload)
        .map_err(|_| NodeError::MalformedRequest("non-UTF-8 discovery payload".to_string()))?;
    let (id, port) = text
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| NodeError::MalformedRequest(format!("unparsable payload '{}'", text)))?;
    if id.is_empty() {
        return Err(NodeError::MalformedRequest(
            "legacy payload with empty node id".to_string(),
        ));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| NodeError::MalformedRequest(format!("bad port in payload '{}'", text)))?;
    Ok(Announcement::new(id, port))
}

/// A peer as currently known to discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub address: IpAddr,
    pub port: u16,
    pub last_seen_ms: i64,
}

impl PeerInfo {
    pub fn rpc_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_roundtrip() {
        let ann = Announcement::new("node-ab12", 50051);
        let json = serde_json::to_string(&ann).unwrap();
        assert!(json.contains("\"type\":\"discovery\""));
        assert!(json.contains("\"grpc_port\":50051"));

        let parsed = parse_datagram(json.as_bytes()).unwrap();
        assert_eq!(parsed, ann);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let json = r#"{"type":"discovery","node_id":"n1","grpc_port":1234,"extra":true}"#;
        let parsed = parse_datagram(json.as_bytes()).unwrap();
        assert_eq!(parsed.node_id, "n1");
        assert_eq!(parsed.grpc_port, 1234);
    }

    #[test]
    fn test_legacy_form() {
        let parsed = parse_datagram(b"old-node:50052").unwrap();
        assert_eq!(parsed.node_id, "old-node");
        assert_eq!(parsed.grpc_port, 50052);
    }

    #[test]
    fn test_legacy_form_with_colons_in_id() {
        let parsed = parse_datagram(b"ns:node:7777").unwrap();
        assert_eq!(parsed.node_id, "ns:node");
        assert_eq!(parsed.grpc_port, 7777);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_datagram(b"").is_err());
        assert!(parse_datagram(b"no-port-here").is_err());
        assert!(parse_datagram(b"id:notaport").is_err());
        assert!(parse_datagram(br#"{"type":"other","node_id":"n","grpc_port":1}"#).is_err());
        assert!(parse_datagram(br#"{"type":"discovery"}"#).is_err());
        assert!(parse_datagram(&[0xFF, 0xFE]).is_err());
    }
}
