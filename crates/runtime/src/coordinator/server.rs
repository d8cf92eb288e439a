//! HTTP listener for the coordinator
//!
//! Routes:
//! - `POST /functions` registers a function from `{name, image, runtime}`
//! - `POST /invoke/:name` runs a function with the raw body as its event
//! - `GET /health` liveness probe

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::QueryRejection, DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::Coordinator;
use crate::config::PlatformConfig;
use crate::types::{CoordinatorError, InvocationContext, ServerError};

/// How long the listener waits for connections to finish once in-flight
/// invocations have been cancelled
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How a shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight request finished within the grace period
    Graceful,
    /// The grace period expired and outstanding invocations were cancelled
    Forced,
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub max_body_bytes: usize,
    pub shutdown_grace: Duration,
    pub drain_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            max_body_bytes: 1_048_576,
            shutdown_grace: Duration::from_secs(5),
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

impl ServeOptions {
    pub fn from_config(config: &PlatformConfig) -> Self {
        Self {
            max_body_bytes: config.max_body_bytes,
            shutdown_grace: config.shutdown_grace,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

/// Body of `POST /functions`. Absent fields fail validation, not parsing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub runtime: String,
}

#[derive(Debug, Deserialize)]
struct InvokeParams {
    timeout_ms: Option<u64>,
}

/// Shared state for the HTTP server
#[derive(Clone)]
struct ServerState {
    coordinator: Arc<Coordinator>,
    /// Parent of every invocation's cancellation token
    invocations: CancellationToken,
}

/// Build the router without a shutdown lifecycle (tests, embedding)
pub fn router(coordinator: Arc<Coordinator>, max_body_bytes: usize) -> Router {
    build_router(
        ServerState {
            coordinator,
            invocations: CancellationToken::new(),
        },
        max_body_bytes,
    )
}

fn build_router(state: ServerState, max_body_bytes: usize) -> Router {
    Router::new()
        .route(
            "/functions",
            post(deploy_handler).fallback(method_not_allowed),
        )
        .route(
            "/invoke/",
            post(missing_name_handler).fallback(method_not_allowed),
        )
        .route(
            "/invoke/:name",
            post(invoke_handler).fallback(method_not_allowed),
        )
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the listening socket
pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}

/// Serve until `shutdown` is cancelled.
///
/// On shutdown the listener stops accepting connections and in-flight
/// requests get `shutdown_grace` to finish. After that, outstanding
/// invocations are cancelled (their sandboxes are still removed) and the
/// remaining connections get `drain_timeout` before the server is aborted.
pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    options: ServeOptions,
    shutdown: CancellationToken,
) -> Result<ShutdownOutcome, ServerError> {
    let invocations = CancellationToken::new();
    let app = build_router(
        ServerState {
            coordinator,
            invocations: invocations.clone(),
        },
        options.max_body_bytes,
    );

    match listener.local_addr() {
        Ok(addr) => tracing::info!(%addr, "Starting HTTP server"),
        Err(_) => tracing::info!("Starting HTTP server"),
    }

    let stop_accepting = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { stop_accepting.cancelled().await })
            .await
    });

    tokio::select! {
        result = &mut server => {
            // The server only ends on its own when it fails
            join_result(result)?;
            return Ok(ShutdownOutcome::Graceful);
        }
        _ = shutdown.cancelled() => {}
    }

    tracing::info!("Shutting down server");

    if let Ok(result) = tokio::time::timeout(options.shutdown_grace, &mut server).await {
        join_result(result)?;
        tracing::info!("Server stopped gracefully");
        return Ok(ShutdownOutcome::Graceful);
    }

    tracing::warn!(
        "Grace period of {:?} elapsed, cancelling in-flight invocations",
        options.shutdown_grace
    );
    invocations.cancel();

    match tokio::time::timeout(options.drain_timeout, &mut server).await {
        Ok(result) => join_result(result)?,
        Err(_) => {
            tracing::warn!("Connections still open after drain timeout, aborting server");
            server.abort();
        }
    }

    Ok(ShutdownOutcome::Forced)
}

fn join_result(
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), ServerError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ServerError::Serve(e.to_string())),
        Err(e) => Err(ServerError::Serve(format!("server task failed: {e}"))),
    }
}

/// Handle `POST /functions`
async fn deploy_handler(State(state): State<ServerState>, body: Bytes) -> Response {
    let request: DeployRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Invalid deploy request body: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
        }
    };

    match state
        .coordinator
        .register(&request.name, &request.image, &request.runtime)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Handle `POST /invoke/:name`
async fn invoke_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
    params: Result<Query<InvokeParams>, QueryRejection>,
    body: Bytes,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(e) => {
            tracing::warn!("Invalid invoke query: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid timeout_ms").into_response();
        }
    };

    let mut ctx = InvocationContext::new().with_cancellation(state.invocations.child_token());
    match params.timeout_ms {
        Some(0) => {
            return (StatusCode::BAD_REQUEST, "timeout_ms must be greater than 0").into_response();
        }
        Some(ms) => ctx = ctx.with_deadline(Duration::from_millis(ms)),
        None => {}
    }

    match state.coordinator.invoke(&name, body, ctx).await {
        Ok(output) => ([(header::CONTENT_TYPE, "application/json")], output).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /invoke/` without a function name
async fn missing_name_handler() -> Response {
    tracing::warn!("Missing function name in invoke request");
    (StatusCode::BAD_REQUEST, "Function name required").into_response()
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn method_not_allowed() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").into_response()
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            CoordinatorError::Validation(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            CoordinatorError::FunctionNotFound(_) => {
                (StatusCode::NOT_FOUND, "Function not found".to_string())
            }
            CoordinatorError::AlreadyRegistered(_) => (StatusCode::CONFLICT, self.to_string()),
            CoordinatorError::RegistryWrite(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to store function".to_string(),
            ),
            CoordinatorError::RegistryRead(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to look up function".to_string(),
            ),
            CoordinatorError::Execution(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Function execution failed: {e}"),
            ),
        };

        (status, message).into_response()
    }
}
