//! HTTP server setup and middleware.

use std::any::Any;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::{Router, middleware};
use runlet_core::{CronScheduler, Store};
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{Any as AnyOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api::{self, ApiError};
use crate::config::AppConfig;
use crate::logging::OpTimer;
use crate::{AppState, log_banner, log_init_step, log_success};

/// Runlet version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Open the store and build the shared state. The store lock is held for
/// the lifetime of the returned state.
pub fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let timer = OpTimer::new("store", "open");
    let opened = Store::open(&config.store.index);
    timer.finish_with_result(opened.as_ref());
    let store = opened
        .with_context(|| format!("cannot open index at {}", config.store.index.display()))?;
    Ok(AppState::new(config, Arc::new(store)))
}

/// Routes plus middleware, without the scheduler.
pub fn create_router(state: AppState) -> anyhow::Result<Router> {
    let body_limit = state.config.body_limit()?;
    let request_timeout = state.config.request_timeout();

    let app = api::create_router(state.clone())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(middleware::map_response(json_failures))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AnyOrigin)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin),
        )
        .with_state(state);

    Ok(app)
}

/// Create the application: open the store, start the cron scheduler and
/// build the router.
pub async fn create_app(config: AppConfig) -> anyhow::Result<Router> {
    let overall_timer = OpTimer::new("server", "create_app");

    log_banner!(
        format!("runlet v{VERSION}"),
        format!(
            "Index: {} | Max exec time: {}s",
            config.store.index.display(),
            config.sandbox.max_exec_time
        )
    );

    // [1/3] Store
    let state = build_state(config)?;
    log_init_step!(
        1,
        3,
        "Store",
        format!(
            "{} ({} globals, {} crons)",
            state.store.path().display(),
            state.store.globals_get().len(),
            state.store.crons_get().len()
        )
    );

    // [2/3] Scheduler
    let step_timer = OpTimer::new("server", "scheduler");
    let scheduler = CronScheduler::new(
        state.sandbox.clone(),
        state.net.clone(),
        state.config.exec_timeout(),
    );
    if scheduler.spawn().is_none() {
        anyhow::bail!("cron scheduler is already running for this index");
    }
    log_init_step!(2, 3, "Scheduler", "live cron reload enabled");
    step_timer.finish();

    // [3/3] Router
    let step_timer = OpTimer::new("server", "router");
    let allow_list = match &state.net {
        runlet_core::NetworkCapability::AllowAll => "any host".to_string(),
        runlet_core::NetworkCapability::AllowList(hosts) => hosts.join(", "),
    };
    let app = create_router(state)?;
    log_init_step!(3, 3, "Router", format!("fetch allowed to {allow_list}"));
    step_timer.finish();

    overall_timer.finish();
    log_success!("runlet server created successfully");

    Ok(app)
}

/// Longest plain-text failure body carried over into the envelope.
const MAX_REJECTION_TEXT: usize = 4 * 1024;

/// Wrap plain-text failures (body limit, request timeout, unknown route)
/// in the JSON failure envelope.
async fn json_failures(response: Response) -> Response {
    let status = response.status();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if is_json || !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let bytes = axum::body::to_bytes(response.into_body(), MAX_REJECTION_TEXT)
        .await
        .unwrap_or_default();
    let text = String::from_utf8_lossy(&bytes).trim().to_string();
    let message = if text.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        text
    };
    ApiError::Rejected { status, message }.into_response()
}

/// Render a handler panic as the JSON failure envelope.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    ApiError::Internal(details).into_response()
}
