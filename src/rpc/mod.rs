//! RPC plumbing: the outbound peer handle and the inbound server.
//!
//! Both ends speak the length-framed CBOR protocol from [`crate::wire`]
//! over plaintext TCP. Encrypting the transport means wrapping the stream
//! before it reaches the codec; nothing above this module would change.

mod peer;
mod server;

pub use peer::PeerHandle;
pub use server::RpcServer;

use crate::config::NodeConfig;
use crate::errors::Result;
use crate::inference::InferenceState;
use crate::model::{Shard, Tensor};
use crate::topology::Topology;
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;

/// Transport tuning shared by peer handles and the server.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Keep-alive ping period
    pub keepalive: Duration,

    /// How long after a ping an unanswered connection is considered dead
    pub keepalive_timeout: Duration,

    /// Per-call deadline
    pub call_deadline: Duration,

    /// Dial timeout
    pub connect_timeout: Duration,

    /// Grace period close() waits for in-flight calls
    pub close_grace: Duration,

    /// Maximum framed message size
    pub max_message_bytes: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(5),
            call_deadline: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            close_grace: Duration::from_secs(2),
            max_message_bytes: 256 * 1024 * 1024,
        }
    }
}

impl RpcConfig {
    pub fn from_node_config(config: &NodeConfig) -> Self {
        Self {
            keepalive: config.rpc_keepalive(),
            call_deadline: config.rpc_call_deadline(),
            max_message_bytes: config.max_message_bytes,
            ..Default::default()
        }
    }
}

/// Inbound call dispatch interface, implemented by the orchestrator.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_prompt(
        &self,
        shard: Shard,
        prompt: String,
        request_id: String,
        state: Option<InferenceState>,
    ) -> Result<Tensor>;

    async fn handle_tensor(
        &self,
        shard: Shard,
        tensor: Tensor,
        request_id: String,
        state: Option<InferenceState>,
    ) -> Result<Tensor>;

    async fn handle_topology(
        &self,
        visited: HashSet<String>,
        max_depth: i32,
    ) -> Result<Topology>;

    async fn handle_result(
        &self,
        request_id: String,
        token_ids: Vec<i32>,
        is_finished: bool,
    ) -> Result<()>;

    async fn handle_opaque_status(&self, request_id: String, status: String) -> Result<()>;

    fn is_healthy(&self) -> bool;
}
