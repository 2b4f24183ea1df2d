//! HTTP API Server
//!
//! Admin REST API: status queries, reservations, request review and manual
//! promotion.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::node::{Node, StopSignal, Submitted};
use crate::registry::{Role, UserRequest};

/// Shared application state
pub struct AppState {
    pub node: Arc<Node>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, node: Arc<Node>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { node }),
        }
    }

    /// Create the router
    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            // Status and info
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/state", get(handle_state))
            // Reservations
            .route(
                "/requests",
                get(handle_list_requests)
                    .post(handle_submit)
                    .delete(handle_resolve),
            )
            // Admin operations
            .route("/admin/promote", post(handle_promote))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `stop` is raised
    pub async fn start(&self, stop: StopSignal) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = tokio::task::spawn_blocking(move || stop.wait()).await;
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }

    /// Run the server on its own thread with a single-threaded runtime
    pub fn spawn(self, stop: StopSignal) -> Result<std::thread::JoinHandle<()>> {
        let handle = std::thread::Builder::new()
            .name("http-api".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("Failed to build HTTP runtime: {}", e);
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(self.start(stop)) {
                    tracing::error!("HTTP API failed: {}", e);
                }
            })?;
        Ok(handle)
    }
}

// ============ Request/Response Types ============

/// Reserve or release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationAction {
    Reserve,
    Release,
}

/// Reservation request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub host: String,
    pub user: String,
    pub action: ReservationAction,
    #[serde(default)]
    pub comment: String,
}

impl ReservationRequest {
    pub fn into_user_request(self) -> UserRequest {
        match self.action {
            ReservationAction::Reserve => UserRequest::reserve(self.host, self.user, self.comment),
            ReservationAction::Release => UserRequest::release(self.host, self.user),
        }
    }
}

/// Submit response
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub outcome: Submitted,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub role: Role,
}

/// Generic action response
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(error: Error) -> Response {
    let (status, code) = match &error {
        Error::Rejected(_) => (StatusCode::CONFLICT, "REJECTED"),
        Error::NotMaster(_) => (StatusCode::CONFLICT, "NOT_MASTER"),
        Error::NoMaster => (StatusCode::SERVICE_UNAVAILABLE, "NO_MASTER"),
        Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node.id().to_string(),
        role: state.node.role(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.status())
}

async fn handle_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.snapshot())
}

async fn handle_list_requests(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pending: Vec<UserRequest> = state.node.snapshot().pending_requests.iter().cloned().collect();
    Json(pending)
}

async fn handle_submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReservationRequest>,
) -> Response {
    match state.node.submit_request(req.into_user_request()) {
        Ok(outcome) => {
            let status = match outcome {
                Submitted::Applied => StatusCode::OK,
                Submitted::Forwarded => StatusCode::ACCEPTED,
            };
            (status, Json(SubmitResponse { success: true, outcome })).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_resolve(State(state): State<Arc<AppState>>) -> Response {
    match state.node.resolve_requests() {
        Ok(resolved) => Json(resolved).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_promote(State(state): State<Arc<AppState>>) -> Response {
    tracing::info!("Promotion requested through the API");

    // Role transitions join threads, keep them off the runtime
    let node = Arc::clone(&state.node);
    let outcome = tokio::task::spawn_blocking(move || node.force_master())
        .await
        .map_err(|e| Error::Internal(format!("promotion task failed: {}", e)))
        .and_then(|r| r);

    match outcome {
        Ok(()) => Json(ActionResponse {
            success: true,
            message: Some(format!("{} is now master", state.node.id())),
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}
