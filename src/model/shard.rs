use crate::errors::{NodeError, Result};
use serde::{Deserialize, Serialize};

/// An inclusive range of transformer layers of a specific model assigned
/// to one node.
///
/// Invariant: `0 <= start_layer <= end_layer <= n_layers - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    /// Model identifier (e.g., "llama-3.2-1b")
    pub model_id: String,

    /// First layer held by this node (inclusive)
    pub start_layer: u32,

    /// Last layer held by this node (inclusive)
    pub end_layer: u32,

    /// Total layers in the model
    pub n_layers: u32,
}

impl Shard {
    /// Create a validated shard.
    pub fn new(model_id: impl Into<String>, start_layer: u32, end_layer: u32, n_layers: u32) -> Result<Self> {
        let shard = Self {
            model_id: model_id.into(),
            start_layer,
            end_layer,
            n_layers,
        };
        shard.validate()?;
        Ok(shard)
    }

    /// Check the layer-range invariant. Called on every decode.
    pub fn validate(&self) -> Result<()> {
        if self.n_layers == 0 {
            return Err(NodeError::MalformedRequest(format!(
                "shard of {} has zero layers",
                self.model_id
            )));
        }
        if self.start_layer > self.end_layer || self.end_layer > self.n_layers - 1 {
            return Err(NodeError::MalformedRequest(format!(
                "invalid shard bounds {}..{} of {} layers",
                self.start_layer, self.end_layer, self.n_layers
            )));
        }
        Ok(())
    }

    pub fn layer_count(&self) -> u32 {
        self.end_layer - self.start_layer + 1
    }

    pub fn is_first_layer(&self) -> bool {
        self.start_layer == 0
    }

    pub fn is_last_layer(&self) -> bool {
        self.end_layer == self.n_layers - 1
    }

    /// The ring's first range with this shard's layer count. Prompts
    /// relayed to the layer-zero holder carry this shard.
    pub fn first(&self) -> Shard {
        Shard {
            model_id: self.model_id.clone(),
            start_layer: 0,
            end_layer: (self.layer_count() - 1).min(self.n_layers - 1),
            n_layers: self.n_layers,
        }
    }

    /// The next contiguous range of the same layer count, clamped to the
    /// end of the model. Callers must not advance past the last layer.
    pub fn next(&self) -> Shard {
        let start_layer = self.end_layer + 1;
        let end_layer = (self.end_layer + self.layer_count()).min(self.n_layers - 1);
        Shard {
            model_id: self.model_id.clone(),
            start_layer,
            end_layer,
            n_layers: self.n_layers,
        }
    }
}

impl std::fmt::Display for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}..{}/{}]",
            self.model_id, self.start_layer, self.end_layer, self.n_layers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_shard() {
        let shard = Shard::new("m", 0, 5, 12).unwrap();
        assert_eq!(shard.layer_count(), 6);
        assert!(shard.is_first_layer());
        assert!(!shard.is_last_layer());
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        assert!(Shard::new("m", 5, 4, 12).is_err());
        assert!(Shard::new("m", 0, 12, 12).is_err());
        assert!(Shard::new("m", 0, 0, 0).is_err());
    }

    #[test]
    fn test_single_layer_shard() {
        let shard = Shard::new("m", 11, 11, 12).unwrap();
        assert_eq!(shard.layer_count(), 1);
        assert!(shard.is_last_layer());
    }

    #[test]
    fn test_next_advances_by_layer_count() {
        let shard = Shard::new("m", 0, 5, 12).unwrap();
        let next = shard.next();
        assert_eq!(next.start_layer, 6);
        assert_eq!(next.end_layer, 11);
        assert!(next.is_last_layer());
        next.validate().unwrap();
    }

    #[test]
    fn test_first_anchors_at_layer_zero() {
        let shard = Shard::new("m", 6, 11, 12).unwrap();
        let first = shard.first();
        assert_eq!(first.start_layer, 0);
        assert_eq!(first.end_layer, 5);
        assert!(first.is_first_layer());
        first.validate().unwrap();
    }

    #[test]
    fn test_next_clamps_to_model_end() {
        let shard = Shard::new("m", 4, 8, 12).unwrap();
        let next = shard.next();
        assert_eq!(next.start_layer, 9);
        assert_eq!(next.end_layer, 11);
        next.validate().unwrap();
    }
}
