//! Ad-hoc script execution.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Extensions, HeaderMap, Method, Uri, Version};
use axum::{Json, Router, routing::post};
use serde_json::Value;

use super::ApiError;
use super::procedures::request_context;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(execute))
}

/// Run the body as a script. Admin callers may manage crons.
async fn execute(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let script = super::body_text(body)?;
    // The body is the script, so the descriptor carries none.
    let request = request_context(&method, &uri, version, &headers, &extensions, None)?;
    let exports = state
        .sandbox
        .execute(&script, state.capabilities(true).with_request(request))
        .await?;
    Ok(super::result(exports))
}
