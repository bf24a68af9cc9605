//! Cron definitions. Every change wakes the scheduler.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use runlet_core::CronDefinition;
use serde_json::Value;

use super::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/crons", get(list))
        .route("/crons/{key}", post(set).delete(unset))
}

async fn list(State(state): State<AppState>) -> Json<Value> {
    super::data(state.store.crons_get())
}

/// Body is `{"interval": "...", "job": "..."}`.
async fn set(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let definition: CronDefinition = super::parse_json(&body)?;
    if definition.job.trim().is_empty() {
        return Err(ApiError::InvalidInput("cron job is empty".to_string()));
    }

    let store = Arc::clone(&state.store);
    super::blocking(move || store.crons_set(&key, &definition.interval, &definition.job)).await?;
    Ok(super::data(state.store.crons_get()))
}

async fn unset(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = Arc::clone(&state.store);
    super::blocking(move || store.crons_unset(&key)).await?;
    Ok(super::data(state.store.crons_get()))
}
