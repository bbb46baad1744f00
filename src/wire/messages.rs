use crate::errors::NodeError;
use crate::inference::InferenceState;
use crate::model::{Shard, Tensor};
use crate::topology::Topology;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Requests a client can send. Ping doubles as keep-alive and health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    Prompt {
        shard: Shard,
        prompt: String,
        request_id: String,
        /// Opaque inference state; empty means absent
        state: Vec<u8>,
    },
    Tensor {
        shard: Shard,
        tensor: Tensor,
        request_id: String,
        state: Vec<u8>,
    },
    Topology {
        /// Node ids excluded from recursion
        visited: HashSet<String>,
        max_depth: i32,
    },
    Result {
        request_id: String,
        token_ids: Vec<i32>,
        is_finished: bool,
    },
    OpaqueStatus {
        request_id: String,
        status: String,
    },
    Ping,
}

/// Responses, matched to requests by frame sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
    Tensor(Tensor),
    Topology(Topology),
    Ack,
    Pong { healthy: bool },
    Error(WireError),
}

/// Error kind carried across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedRequest,
    NoPeers,
    PeerCommunication,
    PeerClosed,
    Timeout,
    Cancelled,
    Backend,
    Internal,
}

/// Typed error as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&NodeError> for WireError {
    fn from(err: &NodeError) -> Self {
        let kind = match err {
            NodeError::MalformedRequest(_) | NodeError::Serialization(_) => {
                ErrorKind::MalformedRequest
            }
            NodeError::NoPeers => ErrorKind::NoPeers,
            NodeError::PeerCommunication { .. } => ErrorKind::PeerCommunication,
            NodeError::PeerClosed => ErrorKind::PeerClosed,
            NodeError::Timeout => ErrorKind::Timeout,
            NodeError::Cancelled => ErrorKind::Cancelled,
            NodeError::Backend(_) => ErrorKind::Backend,
            NodeError::Io(_) | NodeError::Config(_) | NodeError::Internal(_) => ErrorKind::Internal,
        };
        WireError {
            kind,
            message: err.to_string(),
        }
    }
}

impl WireError {
    /// Reconstruct a typed error on the receiving side.
    pub fn into_node_error(self) -> NodeError {
        match self.kind {
            ErrorKind::MalformedRequest => NodeError::MalformedRequest(self.message),
            ErrorKind::NoPeers => NodeError::NoPeers,
            ErrorKind::PeerCommunication => NodeError::PeerCommunication {
                peer_id: "remote".to_string(),
                reason: self.message,
            },
            ErrorKind::PeerClosed => NodeError::PeerClosed,
            ErrorKind::Timeout => NodeError::Timeout,
            ErrorKind::Cancelled => NodeError::Cancelled,
            ErrorKind::Backend => NodeError::Backend(self.message),
            ErrorKind::Internal => NodeError::Internal(self.message),
        }
    }
}

/// Client-to-server frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub seq: u64,
    pub body: RequestBody,
}

/// Server-to-client frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub seq: u64,
    pub body: ResponseBody,
}

/// Encode optional inference state for the wire: absent becomes empty.
pub fn state_to_wire(state: Option<InferenceState>) -> Vec<u8> {
    state.map(InferenceState::into_bytes).unwrap_or_default()
}

/// Decode wire inference state: empty becomes absent.
pub fn state_from_wire(bytes: Vec<u8>) -> Option<InferenceState> {
    if bytes.is_empty() {
        None
    } else {
        Some(InferenceState(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_mapping() {
        assert_eq!(state_from_wire(Vec::new()), None);
        assert_eq!(
            state_from_wire(vec![1, 2]),
            Some(InferenceState(vec![1, 2]))
        );
        assert_eq!(state_to_wire(None), Vec::<u8>::new());
        assert_eq!(state_to_wire(Some(InferenceState(vec![3]))), vec![3]);
    }

    #[test]
    fn test_error_kind_roundtrip() {
        let err = NodeError::NoPeers;
        let wire = WireError::from(&err);
        assert_eq!(wire.kind, ErrorKind::NoPeers);
        assert!(matches!(wire.into_node_error(), NodeError::NoPeers));

        let err = NodeError::MalformedRequest("bad shape".to_string());
        let wire = WireError::from(&err);
        assert_eq!(wire.kind, ErrorKind::MalformedRequest);
        let back = wire.into_node_error();
        assert!(back.to_string().contains("bad shape"));
    }

    #[test]
    fn test_request_frame_cbor_roundtrip() {
        let frame = RequestFrame {
            seq: 42,
            body: RequestBody::Topology {
                visited: ["a".to_string(), "b".to_string()].into_iter().collect(),
                max_depth: 2,
            },
        };

        let mut buf = Vec::new();
        ciborium::into_writer(&frame, &mut buf).unwrap();
        let decoded: RequestFrame = ciborium::from_reader(&buf[..]).unwrap();

        assert_eq!(decoded.seq, 42);
        match decoded.body {
            RequestBody::Topology { visited, max_depth } => {
                assert_eq!(visited.len(), 2);
                assert_eq!(max_depth, 2);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_response_frame_cbor_roundtrip() {
        let frame = ResponseFrame {
            seq: 1,
            body: ResponseBody::Error(WireError {
                kind: ErrorKind::Timeout,
                message: "deadline exceeded".to_string(),
            }),
        };

        let mut buf = Vec::new();
        ciborium::into_writer(&frame, &mut buf).unwrap();
        let decoded: ResponseFrame = ciborium::from_reader(&buf[..]).unwrap();

        match decoded.body {
            ResponseBody::Error(e) => assert_eq!(e.kind, ErrorKind::Timeout),
            other => panic!("unexpected body: {:?}", other),
        }
    }
}
