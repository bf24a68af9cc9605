//! Public greeting and health check.

use axum::{Json, Router, routing::get};
use serde::Serialize;
use serde_json::Value;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(greeting))
        .route("/health", get(health_check))
}

async fn greeting() -> Json<Value> {
    super::data(format!(
        "runlet v{}: POST a script to / or store it under /procedure/{{key}}",
        env!("CARGO_PKG_VERSION")
    ))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
