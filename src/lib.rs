pub mod config;
pub mod device;
pub mod discovery;
pub mod errors;
pub mod inference;
pub mod model;
pub mod node;
pub mod observability;
pub mod rpc;
pub mod telemetry;
pub mod topology;
pub mod wire;

pub use config::NodeConfig;
pub use device::{DeviceCapabilities, DeviceFlops};
pub use errors::{ErrorContext, NodeError, Result};
pub use inference::{EchoBackend, InferenceBackend, InferenceState};
pub use model::{Dtype, Shard, Tensor};
pub use node::{Node, NodeStatus, ResultSubscriber};
pub use observability::{init_cli_logging, init_daemon_logging};
pub use rpc::{PeerHandle, RequestHandler, RpcConfig, RpcServer};
pub use telemetry::{ContributionMeter, ContributionSnapshot};
pub use topology::{PeerEdge, Topology};
