//! Shared globals map.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Map, Value};

use super::ApiError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/globals/vars", get(list).post(merge))
        .route("/globals/var/{key}", post(set_one).delete(unset_one))
}

async fn list(State(state): State<AppState>) -> Json<Value> {
    super::data(&*state.store.globals_get())
}

/// Merge a JSON object into the globals.
async fn merge(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let patch: Map<String, Value> = super::parse_json(&body)?;
    let store = Arc::clone(&state.store);
    let globals = super::blocking(move || store.globals_set(patch)).await?;
    Ok(super::data(&*globals))
}

/// Set one key to the JSON body.
async fn set_one(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let value: Value = super::parse_json(&body)?;
    let mut patch = Map::new();
    patch.insert(key, value);

    let store = Arc::clone(&state.store);
    let globals = super::blocking(move || store.globals_set(patch)).await?;
    Ok(super::data(&*globals))
}

async fn unset_one(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = Arc::clone(&state.store);
    let globals = super::blocking(move || store.globals_unset(&[key])).await?;
    Ok(super::data(&*globals))
}
