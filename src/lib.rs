pub mod balancer;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod pool;
pub mod registry;
pub mod runtime;
pub(crate) mod sync;

pub use balancer::{Balancer, BalancerMode};
pub use dispatch::{CallCanceller, CallHandle, CallId, CallPayload, CallResult, CallStatus};
pub use error::BalancerError;
pub use events::{BalancerEvent, EventBus, EventReceiver};
pub use pool::{WorkerId, WorkerSnapshot, WorkerState};
pub use registry::{NetworkId, NodeHealth, NodeId, NodeSnapshot, NodeTarget, Removal};
pub use runtime::config::{BalancerConfig, BalancerConfigBuilder, BalancerConfigParams};
pub use runtime::executor::{CallExecutor, ExecuteFuture, FnExecutor, ProbeFuture};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
