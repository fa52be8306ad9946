//! HTTP API Server
//!
//! REST API for connections, statement execution, status queries and
//! cluster management.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::replication::ReadConsistency;
use crate::session::RequestRouter;

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Routes client operations
    pub router: Arc<RequestRouter>,
}

/// HTTP API server
pub struct HttpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Bind the API listener
    pub async fn bind(bind_address: &str, state: Arc<AppState>) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Create the router
    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            // Connections
            .route("/connections", post(handle_connect))
            .route("/connections/:id/execute", post(handle_execute))
            .route("/connections/:id/query", post(handle_query))
            // Status and info
            .route("/status", get(handle_status))
            .route("/leader", get(handle_leader))
            .route("/health", get(handle_health))
            // Membership
            .route("/join", post(handle_join))
            .route("/remove", post(handle_remove))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until shutdown is signalled
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = Self::router(self.state);
        tracing::info!("HTTP API listening on {}", self.local_addr);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Connection request
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub client: String,
}

/// Statement batch
#[derive(Debug, Deserialize, Serialize)]
pub struct StatementsRequest {
    pub statements: Vec<String>,
    #[serde(default)]
    pub transaction: bool,
}

/// Query string of a read
#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub level: Option<String>,
}

/// Join request
#[derive(Debug, Deserialize, Serialize)]
pub struct JoinRequest {
    pub node_id: String,
    pub address: String,
}

/// Remove request
#[derive(Debug, Deserialize, Serialize)]
pub struct RemoveRequest {
    pub node_id: String,
}

/// Membership change response
#[derive(Debug, Serialize, Deserialize)]
pub struct MembershipResponse {
    pub index: u64,
}

/// Leader response
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub leader_id: String,
    pub leader_address: String,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub is_leader: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error returned by handlers
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotLeader { .. } | Error::NoLeader | Error::QuorumNotReached { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::UnknownConnection(_) | Error::NodeNotFound(_) => StatusCode::NOT_FOUND,
            Error::Timeout(_) | Error::ConnectionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::JoinFailed(_) => StatusCode::CONFLICT,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: format!("{:?}", self.0.code()),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

// ============ Handlers ============

async fn handle_connect(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ConnectRequest>>,
) -> ApiResult {
    let client = body.map(|Json(req)| req.client).unwrap_or_default();
    let info = state.router.connect(&client).await?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

async fn handle_execute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(req): Json<StatementsRequest>,
) -> ApiResult {
    let response = state
        .router
        .execute(id, req.statements, req.transaction)
        .await?;
    Ok(Json(response.json()).into_response())
}

async fn handle_query(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Query(params): Query<QueryParams>,
    Json(req): Json<StatementsRequest>,
) -> ApiResult {
    let level = match params.level {
        Some(level) => level.parse::<ReadConsistency>()?,
        None => ReadConsistency::default(),
    };
    let response = state.router.query(id, req.statements, level).await?;
    Ok(Json(response.json()).into_response())
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.router.raft().status())
}

async fn handle_leader(State(state): State<Arc<AppState>>) -> ApiResult {
    match state.router.raft().current_leader() {
        Some((leader_id, leader_address)) => Ok(Json(LeaderResponse {
            leader_id,
            leader_address,
        })
        .into_response()),
        None => Err(Error::NoLeader.into()),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
        is_leader: state.router.raft().is_leader(),
    })
}

async fn handle_join(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinRequest>,
) -> ApiResult {
    let index = state.router.join(&req.node_id, &req.address).await?;
    Ok(Json(MembershipResponse { index }).into_response())
}

async fn handle_remove(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RemoveRequest>,
) -> ApiResult {
    let index = state.router.remove(&req.node_id).await?;
    Ok(Json(MembershipResponse { index }).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RaftliteConfig;
    use crate::server::RaftliteNode;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn call(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_connection_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let node = RaftliteNode::start(RaftliteConfig::local("n1", dir.path().to_path_buf(), true))
            .await
            .unwrap();
        node.raft().await_leader(Duration::from_secs(5)).await.unwrap();
        let app = HttpServer::router(node.app_state());

        let (status, info) = call(&app, "POST", "/connections", r#"{"client":"http"}"#).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = info["id"].as_u64().unwrap();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/connections/{id}/execute"),
            r#"{"statements":["CREATE TABLE foo (id INTEGER NOT NULL PRIMARY KEY, name TEXT)","INSERT INTO foo(name) VALUES('fiona')"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][1]["last_insert_id"], 1);
        assert_eq!(body["results"][1]["rows_affected"], 1);
        assert!(body["raft_idx"].as_u64().unwrap() > id);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/connections/{id}/query?level=strong"),
            r#"{"statements":["SELECT * FROM foo"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!({"results":[{"columns":["id","name"],"types":["integer","text"],"values":[[1,"fiona"]]}]})
        );

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let node = RaftliteNode::start(RaftliteConfig::local("n1", dir.path().to_path_buf(), true))
            .await
            .unwrap();
        node.raft().await_leader(Duration::from_secs(5)).await.unwrap();
        let app = HttpServer::router(node.app_state());

        let (status, body) = call(
            &app,
            "POST",
            "/connections/1/query?level=eventual",
            r#"{"statements":["SELECT 1"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("eventual"));

        // Index 1 is the bootstrap entry, which is applied and is not a connection.
        let (status, _) = call(
            &app,
            "POST",
            "/connections/1/execute",
            r#"{"statements":["SELECT 1"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "GET", "/leader", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["leader_id"], "n1");

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_rejections_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let node = RaftliteNode::start(RaftliteConfig::local("n1", dir.path().to_path_buf(), true))
            .await
            .unwrap();
        node.raft().await_leader(Duration::from_secs(5)).await.unwrap();
        let app = HttpServer::router(node.app_state());

        let (status, body) = call(&app, "POST", "/remove", r#"{"node_id":"ghost"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NodeNotFound");

        let (status, body) = call(&app, "POST", "/remove", r#"{"node_id":"n1"}"#).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("last voter"));

        // Still the only voter and still leading.
        let (status, body) = call(&app, "GET", "/status", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["voters"].as_array().unwrap().len(), 1);
        assert_eq!(body["leader_id"], "n1");

        node.shutdown().await;
    }
}
