//! cachemeta metadata service
//!
//! Consistency engine of a replicated content-addressable cache metadata
//! service: exactly one master originates writes, a promoted master
//! restores the latest checkpoint and replays the event stream before it
//! serves, and checkpoints are taken periodically without ever overlapping a
//! restore.

pub mod checkpoint;
pub mod checkpoint_loop;
pub mod handlers;
pub mod readiness;
pub mod replay;
pub mod request;
pub mod service;
pub mod status;

#[cfg(test)]
mod testing;

pub use checkpoint::{CheckpointGate, CheckpointManager, CheckpointRegistry, LocalCheckpointManager};
pub use checkpoint_loop::{CheckpointLoop, CheckpointLoopStats};
pub use handlers::MethodHandlers;
pub use readiness::{Lifecycle, NodeStatus, ReadinessState};
pub use replay::{ReplayDispatcher, ReplayOutcome};
pub use request::{MethodKind, RequestBody, ResponseBody, ServiceRequest, ServiceResponse};
pub use service::{LOG_CURSOR_KEY, MetadataService, RestoreReport, ServiceComponents};
