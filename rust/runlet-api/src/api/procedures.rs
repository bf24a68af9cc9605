//! Stored procedures: save, delete, search and run.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{CONTENT_TYPE, HOST};
use axum::http::{Extensions, HeaderMap, Method, Uri, Version};
use axum::routing::{get, post};
use axum::{Json, Router};
use runlet_core::store::query::quote_key;
use runlet_core::{Procedure, RequestContext};
use serde::Deserialize;
use serde_json::{Value, json};

use super::ApiError;
use crate::AppState;

/// Admin-only procedure management.
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/procedure/search", post(search))
        .route("/procedure/{key}", post(save).delete(remove))
}

/// Anyone may run a stored procedure.
pub fn public_router() -> Router<AppState> {
    Router::new().route("/procedure/{key}/result", get(run).post(run))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchRequest {
    query: String,
    sort: Vec<String>,
    offset: i64,
    limit: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SaveParams {
    /// Comma-separated tags.
    tags: String,
}

async fn search(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: SearchRequest = if body.is_empty() {
        SearchRequest::default()
    } else {
        super::parse_json(&body)?
    };

    let store = Arc::clone(&state.store);
    let found = super::blocking(move || {
        store.find(&request.query, &request.sort, request.offset, request.limit)
    })
    .await?;
    Ok(super::data(found))
}

async fn save(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<SaveParams>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let code = super::body_text(body)?;
    if code.trim().is_empty() {
        return Err(ApiError::InvalidInput("procedure code is empty".to_string()));
    }
    let tags = params
        .tags
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string);
    let procedure = Procedure::new(key, code).with_tags(tags);

    let store = Arc::clone(&state.store);
    let saved = procedure.clone();
    super::blocking(move || store.put(saved)).await?;
    tracing::info!(procedure = %procedure.key, tags = ?procedure.tags, "Procedure saved");
    Ok(super::data(procedure))
}

async fn remove(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = Arc::clone(&state.store);
    let deleted = key.clone();
    super::blocking(move || store.delete(&deleted)).await?;
    tracing::info!(procedure = %key, "Procedure deleted");
    Ok(super::data(json!({ "key": key })))
}

/// Look the procedure up by exact key and run it against this request.
async fn run(
    State(state): State<AppState>,
    Path(key): Path<String>,
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let store = Arc::clone(&state.store);
    let query = format!("+key:{}", quote_key(&key));
    let found = super::blocking(move || store.find(&query, &[], 0, 1)).await?;
    let code = found
        .hits
        .first()
        .and_then(|hit| hit.get("code"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ApiError::ProcedureNotFound(key.clone()))?;

    let request = request_context(&method, &uri, version, &headers, &extensions, Some(&body))?;
    let exports = state
        .sandbox
        .execute(&code, state.capabilities(false).with_request(request))
        .await?;
    Ok(super::result(exports))
}

/// Describe the inbound request for the script's `request` constant.
/// Without a body the descriptor carries `null`.
pub(crate) fn request_context(
    method: &Method,
    uri: &Uri,
    version: Version,
    headers: &HeaderMap,
    extensions: &Extensions,
    body: Option<&Bytes>,
) -> Result<RequestContext, ApiError> {
    let Query(query) = Query::<BTreeMap<String, String>>::try_from_uri(uri)
        .map_err(|e| ApiError::InvalidInput(format!("invalid query string: {e}")))?;

    let mut flattened = BTreeMap::new();
    for name in headers.keys() {
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect();
        flattened.insert(name.as_str().to_string(), values.join(", "));
    }

    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.host())
        .unwrap_or_default()
        .to_string();
    let remote_addr = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let content_type = headers.get(CONTENT_TYPE).and_then(|h| h.to_str().ok());

    Ok(RequestContext {
        uri: uri.to_string(),
        method: method.to_string(),
        proto: format!("{version:?}"),
        host,
        remote_addr,
        query,
        headers: flattened,
        body: body.map_or(Value::Null, |body| RequestContext::decode_body(content_type, body)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_request_context_from_parts() {
        let uri: Uri = "/procedure/hi/result?name=bob&lang=en".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("runlet.local"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 52100))));

        let ctx = request_context(
            &Method::POST,
            &uri,
            Version::HTTP_11,
            &headers,
            &extensions,
            Some(&Bytes::from_static(br#"{"n": 1}"#)),
        )
        .unwrap();

        assert_eq!(ctx.uri, "/procedure/hi/result?name=bob&lang=en");
        assert_eq!(ctx.method, "POST");
        assert_eq!(ctx.proto, "HTTP/1.1");
        assert_eq!(ctx.host, "runlet.local");
        assert_eq!(ctx.remote_addr, "10.0.0.7:52100");
        assert_eq!(ctx.query["name"], "bob");
        assert_eq!(ctx.headers["x-tag"], "a, b");
        assert_eq!(ctx.body, json!({"n": 1}));
    }

    #[test]
    fn test_request_context_text_body() {
        let uri: Uri = "/procedure/hi/result".parse().unwrap();
        let ctx = request_context(
            &Method::GET,
            &uri,
            Version::HTTP_11,
            &HeaderMap::new(),
            &Extensions::new(),
            Some(&Bytes::from_static(b"plain words")),
        )
        .unwrap();
        assert!(ctx.query.is_empty());
        assert_eq!(ctx.host, "");
        assert_eq!(ctx.remote_addr, "");
        assert_eq!(ctx.body, json!("plain words"));
    }

    #[test]
    fn test_request_context_without_body() {
        let uri: Uri = "/?name=bob".parse().unwrap();
        let ctx = request_context(
            &Method::POST,
            &uri,
            Version::HTTP_11,
            &HeaderMap::new(),
            &Extensions::new(),
            None,
        )
        .unwrap();
        assert_eq!(ctx.query["name"], "bob");
        assert_eq!(ctx.body, Value::Null);
    }
}
