use thiserror::Error;

/// Errors that can occur in the node.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Request could not be decoded or failed validation (bad tensor shape,
    /// invalid shard bounds, oversized request id).
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Peer selection was required but the pool is empty.
    #[error("no live peers in pool")]
    NoPeers,

    /// Transport failure talking to a specific peer.
    #[error("communication with peer {peer_id} failed: {reason}")]
    PeerCommunication { peer_id: String, reason: String },

    /// Operation on a peer handle after close().
    #[error("peer handle is closed")]
    PeerClosed,

    /// Per-call deadline exceeded.
    #[error("deadline exceeded")]
    Timeout,

    /// Operation observed cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// The inference backend raised.
    #[error("inference backend failed: {0}")]
    Backend(String),

    /// IO error (sockets, files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("configuration error: {0}")]
    Config(String),

    /// Invariant violation inside the node.
    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Wrap a transport error with the peer it occurred on.
    pub fn peer(peer_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        NodeError::PeerCommunication {
            peer_id: peer_id.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for NodeError {
    fn from(e: toml::ser::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(e: toml::de::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context message to error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context using a closure (for lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<NodeError>,
{
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| {
            let base: NodeError = e.into();
            tracing::error!("{}: {:?}", msg, base);
            base
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let base: NodeError = e.into();
            let msg = f();
            tracing::error!("{}: {:?}", msg, base);
            base
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NodeError::Config("missing node id".to_string());
        assert_eq!(err.to_string(), "configuration error: missing node id");
    }

    #[test]
    fn test_peer_error_carries_id() {
        let err = NodeError::peer("node-a", "connection reset");
        assert_eq!(
            err.to_string(),
            "communication with peer node-a failed: connection reset"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "socket gone");
        let node_err: NodeError = io_err.into();
        assert!(node_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_context_preserves_error() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let err = result.context("opening socket").unwrap_err();
        assert!(matches!(err, NodeError::Io(_)));
    }
}
