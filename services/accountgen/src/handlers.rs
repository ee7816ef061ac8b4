//! HTTP handlers
//!
//! A single JSON-RPC endpoint at the root plus a plain-text liveness probe.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RequestMapper};

/// Shared application state
pub struct AppState {
    pub mapper: RequestMapper,
}

/// POST / — decode a JSON-RPC request and dispatch it through the mapper.
pub async fn json_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> Json<JsonRpcResponse> {
    tracing::debug!("Received JSON-RPC request: {}", request.method);
    Json(state.mapper.dispatch(&request).await)
}

/// GET /upcheck — liveness probe. Reports process liveness only, never
/// backend health.
pub async fn upcheck() -> &'static str {
    "OK"
}
