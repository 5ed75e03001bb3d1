//! HTTP status endpoint
//!
//! `GET /status` reports readiness, the last restore and checkpoint, and
//! store entry counts as JSON. `GET /health` answers 200 only while the node
//! is a ready master.

use crate::checkpoint_loop::{CheckpointLoop, CheckpointLoopStats};
use crate::readiness::{Lifecycle, NodeStatus};
use crate::service::{MetadataService, RestoreReport};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use cachemeta_common::{CheckpointState, Role};
use cachemeta_store::StoreCounts;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

pub struct StatusState {
    pub node_name: String,
    pub service: Arc<MetadataService>,
    pub checkpoints: Arc<CheckpointLoop>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub node: String,
    pub lifecycle: Lifecycle,
    pub role: Role,
    pub status: NodeStatus,
    pub force_client_retries: bool,
    pub checkpoint_restored: bool,
    pub restore_generation: u64,
    pub last_restore: Option<RestoreReport>,
    pub last_checkpoint: Option<CheckpointState>,
    pub checkpoint_loop: CheckpointLoopStats,
    pub store: Option<StoreCounts>,
}

pub fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn status_handler(State(state): State<Arc<StatusState>>) -> Json<StatusReport> {
    let readiness = state.service.readiness();
    let store = state
        .service
        .store_counts()
        .inspect_err(|e| warn!("Failed to count store entries: {}", e))
        .ok();

    Json(StatusReport {
        node: state.node_name.clone(),
        lifecycle: readiness.lifecycle(),
        role: readiness.role(),
        status: state.service.status(),
        force_client_retries: state.service.force_client_retries(),
        checkpoint_restored: readiness.checkpoint_restored(),
        restore_generation: readiness.generation(),
        last_restore: state.service.last_restore(),
        last_checkpoint: state.service.last_checkpoint(),
        checkpoint_loop: state.checkpoints.stats(),
        store,
    })
}

async fn health_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    match state.service.status() {
        NodeStatus::Ready => (StatusCode::OK, "READY"),
        NodeStatus::Worker => (StatusCode::SERVICE_UNAVAILABLE, "WORKER"),
        NodeStatus::Restoring => (StatusCode::SERVICE_UNAVAILABLE, "RESTORING"),
        NodeStatus::Stale => (StatusCode::SERVICE_UNAVAILABLE, "STALE"),
        NodeStatus::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "STOPPED"),
    }
}
