//! HTTP server implementation using Axum.

use crate::config::MAX_BODY_BYTES;
use crate::executor::ExecutionResult;
use crate::rate_limit::spawn_eviction;
use crate::state::AppState;
use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, DefaultBodyLimit, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// Request/Response types
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    code: String,
    session_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    image: String,
    image_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    time_limit_ms: u64,
    memory_limit_bytes: u64,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Build the router. Exposed separately from [`run_server`] for tests.
pub fn router(state: AppState) -> Router {
    let rate_limited = middleware::from_fn_with_state(state.clone(), rate_limit);

    Router::new()
        .route("/api/execute", post(execute).layer(rate_limited))
        .route("/api/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on `addr` until Ctrl+C or SIGTERM.
pub async fn run_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    spawn_eviction(state.limiter.clone());

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Starting HTTP server on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

/// Client identity for rate limiting: the peer address, or the first
/// `X-Forwarded-For` hop when the service sits behind a trusted proxy.
fn client_key(request: &Request, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client = client_key(&request, state.trust_proxy);
    match state.limiter.check(&client).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            warn!(client = %client, "rate limit exceeded");
            let secs = retry_after.as_secs().max(1);
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, secs.to_string())],
                Json(ErrorResponse {
                    error: "Too many execution requests, please try again later".to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let Json(req) = payload.map_err(|rejection| {
        let status = match rejection.status() {
            StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        api_error(status, rejection.body_text())
    })?;

    if req.session_id.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "sessionId must be non-empty",
        ));
    }

    info!(session_id = %req.session_id, "POST /api/execute");

    // Spawned so a client disconnect cannot interrupt cleanup.
    let executor = state.executor.clone();
    let result = tokio::spawn(async move {
        executor
            .execute(&req.code, Some(req.session_id.as_str()))
            .await
    })
    .await
    .map_err(|e| {
        error!(error = %e, "execution task failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    })?;

    Ok(Json(result))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let policy = state.executor.policy();
    let (status, image_available, error) =
        match state.executor.runtime().image_available(&policy.image).await {
            Ok(true) => (StatusCode::OK, true, None),
            Ok(false) => (
                StatusCode::SERVICE_UNAVAILABLE,
                false,
                Some(format!("image {} not found", policy.image)),
            ),
            Err(e) => (StatusCode::SERVICE_UNAVAILABLE, false, Some(e.to_string())),
        };

    let body = HealthResponse {
        status: if image_available { "ok" } else { "unavailable" },
        image: policy.image.clone(),
        image_available,
        error,
        time_limit_ms: policy.time_limit.as_millis() as u64,
        memory_limit_bytes: policy.memory_limit_bytes,
    };
    (status, Json(body))
}
