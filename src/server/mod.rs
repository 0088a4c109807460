//! HTTP server for agentmesh
//!
//! Serves two surfaces from one router:
//!
//! - the coordination store (`/store/...`), used by [`RemoteStore`] clients
//!   in other processes;
//! - the collaborator API (decisions, escalations, queues, streams,
//!   breakers, metrics), rate limited per client IP.
//!
//! # Routes
//!
//! - `POST /store/command` - Execute one store command
//! - `POST /store/transaction` - Execute commands atomically
//! - `POST /store/subscriptions` - Open a buffered pub/sub subscription
//! - `GET /store/subscriptions/{id}` - Long-poll buffered messages
//! - `DELETE /store/subscriptions/{id}` - Close a subscription
//! - `GET /health`
//! - `GET|POST /decisions`, `GET /decisions/{id}`
//! - `POST /decisions/{id}/votes`, `/approve`, `/reject`
//! - `GET /escalations`, `POST /escalations/{id}/respond`
//! - `POST /queues/{agent}/tasks`, `GET /queues/{agent}`
//! - `GET /streams/{stream}`
//! - `GET /breakers`, `POST /breakers/{name}/{open,close,clear,reset}`
//! - `GET /metrics`
//!
//! [`RemoteStore`]: crate::store::RemoteStore

mod api;
mod store_api;

pub use store_api::SubscriptionHub;

use crate::config::ServerSettings;
use crate::keys;
use crate::mesh::Mesh;
use crate::MeshError;
use axum::{
    body::Body,
    extract::{ConnectInfo, DefaultBodyLimit, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

/// Server error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind error: {0}")]
    Bind(String),
}

impl From<ServerError> for MeshError {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::Io(e) => MeshError::Io(e),
            ServerError::Bind(message) => MeshError::Network(message),
        }
    }
}

/// Shared server state
pub(crate) struct AppState {
    mesh: Arc<Mesh>,
    hub: Arc<SubscriptionHub>,
    settings: ServerSettings,
}

/// HTTP server hosting the store and the API
pub struct MeshServer {
    state: Arc<AppState>,
}

impl MeshServer {
    /// Serve `mesh`; the store surface exposes `mesh.store()`
    pub fn new(mesh: Arc<Mesh>) -> Self {
        let settings = mesh.config().server.clone();
        let hub = Arc::new(SubscriptionHub::new(mesh.store().clone()));
        Self {
            state: Arc::new(AppState { mesh, hub, settings }),
        }
    }

    /// Build the router; only the API routes are rate limited
    pub fn router(&self) -> Router {
        Self::build_router(self.state.clone())
    }

    fn build_router(state: Arc<AppState>) -> Router {
        let max_body_size = state.settings.max_body_size;
        let api = api::routes().layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

        Router::new()
            .merge(store_api::routes())
            .merge(api)
            .layer(DefaultBodyLimit::max(max_body_size))
            .with_state(state)
    }

    /// Run the server on the given address
    pub async fn run(self, addr: &str) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Run the server on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        tracing::info!(
            addr = %local,
            max_requests = self.state.settings.api_rate_limit.max_requests,
            window_secs = self.state.settings.api_rate_limit.window.as_secs(),
            max_body_size = self.state.settings.max_body_size,
            "agentmesh server listening"
        );

        let reaper = tokio::spawn(self.state.hub.clone().reap_loop());
        let app = Self::build_router(self.state.clone());
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(ServerError::Io);
        reaper.abort();
        result
    }

    pub fn hub(&self) -> &Arc<SubscriptionHub> {
        &self.state.hub
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error, mapped to a status code and an [`ErrorResponse`]
#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Mesh(MeshError),
}

impl From<MeshError> for ApiError {
    fn from(e: MeshError) -> Self {
        ApiError::Mesh(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Mesh(e) => match e {
                MeshError::DecisionNotFound(_) | MeshError::EscalationNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                MeshError::InvalidTransition { .. }
                | MeshError::AlreadyVoted { .. }
                | MeshError::DecisionBusy(_) => StatusCode::CONFLICT,
                MeshError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
                MeshError::Config(_) | MeshError::Json(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = match self {
            ApiError::BadRequest(message) | ApiError::NotFound(message) => message,
            ApiError::Mesh(e) => e.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %error, "Request failed");
        }
        (status, Json(ErrorResponse { error })).into_response()
    }
}

/// Per-IP fixed-window limit on API routes
async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // Tests drive the router without a TCP connection
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let limit = state.settings.api_rate_limit;
    let decision = match state
        .mesh
        .limiter
        .check(&keys::api_rate_limit(&ip), limit.max_requests, limit.window)
        .await
    {
        Ok(decision) => decision,
        Err(e) => {
            // The store is down; let the request fail on its own
            tracing::warn!(ip = %ip, error = %e, "Rate limit check failed, allowing request");
            return next.run(request).await;
        }
    };

    if decision.allowed {
        return next.run(request).await;
    }

    let retry_secs = decision.retry_after.as_secs().max(1);
    tracing::warn!(ip = %ip, retry_after_secs = retry_secs, "Rate limit exceeded");
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("Retry-After", retry_secs.to_string())],
        Json(ErrorResponse {
            error: format!("Rate limit exceeded. Retry after {} seconds.", retry_secs),
        }),
    )
        .into_response()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::MeshConfig;
    use crate::decision::SqliteDecisionRepository;
    use meshstore::MemoryStore;

    pub fn server_with(config: MeshConfig) -> MeshServer {
        let store: crate::store::SharedStore = Arc::new(MemoryStore::new());
        let repo = Arc::new(SqliteDecisionRepository::open_in_memory().unwrap());
        let mesh = Mesh::new(config, store).with_decisions(repo);
        MeshServer::new(Arc::new(mesh))
    }

    pub fn server() -> MeshServer {
        server_with(MeshConfig::new())
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }
}
