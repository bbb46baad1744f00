//! Value types that flow across RPC boundaries: layer shards and tensors.

mod shard;
mod tensor;

pub use shard::Shard;
pub use tensor::{Dtype, Tensor};
