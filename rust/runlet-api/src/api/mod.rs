//! HTTP API endpoints.

pub mod auth;
pub mod crons;
pub mod error;
pub mod exec;
pub mod globals;
pub mod health;
pub mod procedures;

use axum::body::Bytes;
use axum::{Json, Router, middleware};
use runlet_core::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

pub use error::ApiError;

use crate::AppState;

/// Create the API router. Admin routes sit behind the bearer check.
pub fn create_router(state: AppState) -> Router<AppState> {
    let admin = Router::new()
        .merge(exec::router())
        .merge(procedures::admin_router())
        .merge(globals::router())
        .merge(crons::router())
        .route_layer(middleware::from_fn_with_state(state, auth::require_admin));

    Router::new()
        .merge(health::router())
        .merge(procedures::public_router())
        .merge(admin)
}

/// `{"success": true, "data": ...}`
pub(crate) fn data(value: impl Serialize) -> Json<Value> {
    Json(json!({ "success": true, "data": value }))
}

/// `{"success": true, "result": ...}` for script outcomes.
pub(crate) fn result(value: Value) -> Json<Value> {
    Json(json!({ "success": true, "result": value }))
}

pub(crate) fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidInput(format!("invalid JSON body: {e}")))
}

pub(crate) fn body_text(body: Bytes) -> Result<String, ApiError> {
    String::from_utf8(body.to_vec())
        .map_err(|e| ApiError::InvalidInput(format!("body is not valid UTF-8: {e}")))
}

/// Run a store call off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}
