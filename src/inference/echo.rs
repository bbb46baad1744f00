use crate::errors::Result;
use crate::inference::{InferenceBackend, InferenceState};
use crate::model::{Dtype, Shard, Tensor};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Deterministic dependency-free backend.
///
/// Tokenizes by hashing whitespace-separated words, "infers" by echoing
/// values through unchanged, and can simulate per-call compute latency so
/// meter tests see realistic timings. Useful for exercising the full ring
/// path without model weights.
pub struct EchoBackend {
    compute_delay: Duration,
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoBackend {
    pub fn new() -> Self {
        Self {
            compute_delay: Duration::ZERO,
        }
    }

    /// Simulate compute taking `delay` per inference call.
    pub fn with_compute_delay(delay: Duration) -> Self {
        Self {
            compute_delay: delay,
        }
    }

    async fn simulate_compute(&self) {
        if !self.compute_delay.is_zero() {
            tokio::time::sleep(self.compute_delay).await;
        }
    }

    fn token_of(word: &str) -> i32 {
        // FNV-1a, folded to a non-negative i32
        let mut hash: u32 = 0x811c9dc5;
        for byte in word.bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x01000193);
        }
        (hash & 0x7fff_ffff) as i32
    }
}

#[async_trait]
impl InferenceBackend for EchoBackend {
    async fn encode(&self, _shard: &Shard, prompt: &str) -> Result<Vec<i32>> {
        Ok(prompt.split_whitespace().map(Self::token_of).collect())
    }

    async fn decode(&self, _shard: &Shard, tokens: &[i32]) -> Result<String> {
        Ok(tokens
            .iter()
            .map(|t| format!("<{}>", t))
            .collect::<Vec<_>>()
            .join(" "))
    }

    async fn sample(&self, logits: &Tensor, _temperature: f32) -> Result<Vec<i32>> {
        let values = match logits.dtype {
            Dtype::Float32 => logits.to_f32s()?,
            Dtype::Int32 => logits.to_i32s()?.into_iter().map(|v| v as f32).collect(),
        };
        let argmax = values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i as i32)
            .unwrap_or(0);
        Ok(vec![argmax])
    }

    async fn infer_prompt(
        &self,
        request_id: &str,
        shard: &Shard,
        prompt: &str,
        state: Option<InferenceState>,
    ) -> Result<(Tensor, Option<InferenceState>)> {
        self.simulate_compute().await;
        let tokens = self.encode(shard, prompt).await?;
        let values: Vec<f32> = tokens.iter().map(|&t| t as f32).collect();
        let len = values.len().max(1) as i32;
        let tensor = if values.is_empty() {
            Tensor::from_f32s(&[0.0], vec![1, 1])?
        } else {
            Tensor::from_f32s(&values, vec![1, len])?
        };
        debug!(request_id, shard = %shard, tokens = tokens.len(), "echo prompt inference");
        Ok((tensor, state))
    }

    async fn infer_tensor(
        &self,
        request_id: &str,
        shard: &Shard,
        input: &Tensor,
        state: Option<InferenceState>,
    ) -> Result<(Tensor, Option<InferenceState>)> {
        self.simulate_compute().await;
        input.validate()?;
        debug!(request_id, shard = %shard, "echo tensor inference");
        Ok((input.clone(), state))
    }

    async fn load_checkpoint(&self, shard: &Shard, path: &Path) -> Result<()> {
        debug!(shard = %shard, path = %path.display(), "echo checkpoint load (no-op)");
        Ok(())
    }

    async fn clear_session(&self) -> Result<()> {
        Ok(())
    }

    fn supported_models(&self) -> Vec<String> {
        vec!["echo".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> Shard {
        Shard::new("echo", 0, 5, 12).unwrap()
    }

    #[tokio::test]
    async fn test_encode_is_deterministic() {
        let backend = EchoBackend::new();
        let a = backend.encode(&shard(), "hello ring world").await.unwrap();
        let b = backend.encode(&shard(), "hello ring world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert!(a.iter().all(|&t| t >= 0));
    }

    #[tokio::test]
    async fn test_infer_tensor_echoes_input() {
        let backend = EchoBackend::new();
        let input = Tensor::from_f32s(&[1.0, 2.0, 3.0], vec![1, 3]).unwrap();
        let (output, state) = backend
            .infer_tensor("r1", &shard(), &input, None)
            .await
            .unwrap();
        assert_eq!(output, input);
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn test_infer_prompt_shape_matches_tokens() {
        let backend = EchoBackend::new();
        let (output, _) = backend
            .infer_prompt("r1", &shard(), "one two three four", None)
            .await
            .unwrap();
        assert_eq!(output.shape, vec![1, 4]);
    }

    #[tokio::test]
    async fn test_empty_prompt_yields_unit_tensor() {
        let backend = EchoBackend::new();
        let (output, _) = backend.infer_prompt("r1", &shard(), "", None).await.unwrap();
        assert_eq!(output.shape, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_sample_argmax() {
        let backend = EchoBackend::new();
        let logits = Tensor::from_f32s(&[0.1, 0.9, 0.3], vec![3]).unwrap();
        let tokens = backend.sample(&logits, 0.0).await.unwrap();
        assert_eq!(tokens, vec![1]);
    }

    #[tokio::test]
    async fn test_state_passes_through() {
        let backend = EchoBackend::new();
        let input = Tensor::from_f32s(&[1.0], vec![1]).unwrap();
        let state = Some(InferenceState(vec![9, 9, 9]));
        let (_, out_state) = backend
            .infer_tensor("r1", &shard(), &input, state.clone())
            .await
            .unwrap();
        assert_eq!(out_state, state);
    }
}
