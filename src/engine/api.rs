//! Witness API Module
//! Read-only status endpoints for operators

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tower_http::trace::TraceLayer;

use crate::engine::storage::{Partition, SlotPersistence};
use crate::engine::updater::UpdateState;

pub struct ApiState<P: Partition> {
    pub persistence: Arc<SlotPersistence<P>>,
    pub update: Arc<Mutex<UpdateState>>,
}

impl<P: Partition> Clone for ApiState<P> {
    fn clone(&self) -> Self {
        Self {
            persistence: Arc::clone(&self.persistence),
            update: Arc::clone(&self.update),
        }
    }
}

pub fn create_router<P>(state: ApiState<P>) -> Router
where
    P: Partition + 'static,
{
    Router::new()
        .route("/api/health", get(health_check::<P>))
        .route("/api/update/status", get(update_status::<P>))
        .route("/api/checkpoints", get(list_logs::<P>))
        .route("/api/checkpoints/{log_id}", get(get_checkpoint::<P>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub logs: usize,
    pub free_slots: usize,
}

async fn health_check<P: Partition>(State(state): State<ApiState<P>>) -> Json<HealthResponse> {
    let (status, logs, free_slots) = match state.persistence.log_ids() {
        Ok(ids) => ("ok", ids.len(), state.persistence.free_slots().unwrap_or(0)),
        Err(_) => ("uninitialized", 0, 0),
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        logs,
        free_slots,
    })
}

async fn update_status<P: Partition>(State(state): State<ApiState<P>>) -> Json<UpdateState> {
    let snapshot = state
        .update
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    Json(snapshot)
}

async fn list_logs<P: Partition>(
    State(state): State<ApiState<P>>,
) -> Result<Json<Vec<String>>, StatusCode> {
    state
        .persistence
        .log_ids()
        .map(|ids| Json(ids.into_keys().collect()))
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn get_checkpoint<P: Partition>(
    State(state): State<ApiState<P>>,
    Path(log_id): Path<String>,
) -> Response {
    match state.persistence.latest(&log_id) {
        Ok(checkpoint) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            checkpoint,
        )
            .into_response(),
        Err(e) if e.is_not_found() => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
