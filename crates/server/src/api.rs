use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::error;

use orderflow_core::{Order, OrderId};
use orderflow_queue::{IngestSnapshot, PipelineState};
use orderflow_storage::StorageError;

use crate::state::AppState;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(raw_id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("order {raw_id} not found"),
        }),
    )
}

/// Cache errors never leak their detail to clients.
fn lookup_error(raw_id: &str, e: StorageError) -> ApiError {
    if e.is_not_found() {
        return not_found(raw_id);
    }
    error!(order_id = raw_id, error = %e, "order lookup failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal server error".to_string(),
        }),
    )
}

// ── Orders ────────────────────────────────────────────────────────

/// `GET /orders/{id}`. A non-integer id cannot name an order, so it is a 404.
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let id: OrderId = raw_id.trim().parse().map_err(|_| not_found(&raw_id))?;
    let order = state.cache.get(id).map_err(|e| lookup_error(&raw_id, e))?;
    Ok(Json(Order::clone(&order)))
}

// ── Health ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub pipeline: PipelineState,
    pub cached_orders: usize,
    pub ingest: IngestSnapshot,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        pipeline: state.status.current(),
        cached_orders: state.cache.len(),
        ingest: state.metrics.snapshot(),
    })
}
