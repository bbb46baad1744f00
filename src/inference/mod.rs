//! The seam between the node and whatever actually runs the model.
//!
//! The node routes work through the [`InferenceBackend`] trait and never
//! looks inside tensors or inference state. [`EchoBackend`] is the
//! deterministic stand-in used by tests and by `spindle start` until a
//! host wires in a real engine; it is a peer of the real implementation
//! behind the same trait.

mod echo;

pub use echo::EchoBackend;

use crate::errors::Result;
use crate::model::{Shard, Tensor};
use async_trait::async_trait;
use std::path::Path;

/// Opaque per-request-chain state (kv-cache handoff, metadata).
///
/// The node treats this as a value: it is carried across RPC hops
/// unchanged and never inspected. An empty payload on the wire means
/// "absent".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceState(pub Vec<u8>);

impl InferenceState {
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Capability set the node consumes from an inference engine.
///
/// Implementations doing CPU- or GPU-bound work must run it off the I/O
/// runtime (e.g. `tokio::task::spawn_blocking` or a dedicated pool) so
/// request handling stays responsive.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Tokenize a prompt for the shard's model.
    async fn encode(&self, shard: &Shard, prompt: &str) -> Result<Vec<i32>>;

    /// Detokenize model output.
    async fn decode(&self, shard: &Shard, tokens: &[i32]) -> Result<String>;

    /// Sample next tokens from logits.
    async fn sample(&self, logits: &Tensor, temperature: f32) -> Result<Vec<i32>>;

    /// Run the local shard from text input.
    async fn infer_prompt(
        &self,
        request_id: &str,
        shard: &Shard,
        prompt: &str,
        state: Option<InferenceState>,
    ) -> Result<(Tensor, Option<InferenceState>)>;

    /// Run the local shard from tensor input.
    async fn infer_tensor(
        &self,
        request_id: &str,
        shard: &Shard,
        input: &Tensor,
        state: Option<InferenceState>,
    ) -> Result<(Tensor, Option<InferenceState>)>;

    /// Load weights for a shard from disk.
    async fn load_checkpoint(&self, shard: &Shard, path: &Path) -> Result<()>;

    /// Drop any per-session caches.
    async fn clear_session(&self) -> Result<()>;

    /// Models this backend can serve.
    fn supported_models(&self) -> Vec<String>;
}
