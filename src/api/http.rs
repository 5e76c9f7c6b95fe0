//! HTTP API Server
//!
//! Replication status and operator controls for a follower node.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::coordinator::{ReplicationClient, ReplicationStatus};
use crate::error::{Error, Result};
use crate::scheduler::{PollControl, PollStatus};

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Replication client of this node
    pub client: Arc<ReplicationClient>,
    /// Poll switches, absent when no poll interval is configured
    pub poll: Option<Arc<PollControl>>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(
        config: ApiConfig,
        node_id: String,
        client: Arc<ReplicationClient>,
        poll: Option<Arc<PollControl>>,
    ) -> Self {
        let state = Arc::new(AppState {
            node_id,
            client,
            poll,
        });

        Self { config, state }
    }

    /// Create the router
    pub(crate) fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/replication/status", get(handle_status))
            .route("/replication/fetch", post(handle_fetch))
            .route("/replication/abort", post(handle_abort))
            .route("/replication/poll/enable", post(handle_enable_poll))
            .route("/replication/poll/disable", post(handle_disable_poll))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app).await?;

        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub replicating: bool,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    #[serde(flatten)]
    pub replication: ReplicationStatus,
    pub polling: Option<PollStatus>,
}

/// Result of a control request
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
        replicating: state.client.is_busy(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatusResponse {
        node_id: state.node_id.clone(),
        replication: state.client.status().await,
        polling: state.poll.as_ref().map(|poll| poll.status()),
    })
}

async fn handle_fetch(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.client.spawn_cycle() {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(ActionResponse::ok("Replication started")),
        ),
        Err(Error::CycleInProgress) => (
            StatusCode::CONFLICT,
            Json(ActionResponse::failed("Replication already in progress")),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ActionResponse::failed(e.to_string())),
        ),
    }
}

async fn handle_abort(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.client.abort() {
        Json(ActionResponse::ok("Abort requested"))
    } else {
        Json(ActionResponse::failed("No replication in progress"))
    }
}

async fn handle_enable_poll(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    set_polling(&state, true)
}

async fn handle_disable_poll(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    set_polling(&state, false)
}

fn set_polling(state: &AppState, enabled: bool) -> (StatusCode, Json<ActionResponse>) {
    let Some(poll) = &state.poll else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ActionResponse::failed("No poll interval configured")),
        );
    };

    if enabled {
        poll.enable();
        (StatusCode::OK, Json(ActionResponse::ok("Polling enabled")))
    } else {
        poll.disable();
        (StatusCode::OK, Json(ActionResponse::ok("Polling disabled")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommitPoint;
    use crate::testing::{MockLeader, RecordingHost};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApi {
        _dir: tempfile::TempDir,
        leader: Arc<MockLeader>,
        state: Arc<AppState>,
    }

    async fn test_api(poll: bool) -> TestApi {
        let dir = tempfile::tempdir().unwrap();
        let leader = Arc::new(MockLeader::new(4, 2));
        leader.add_index_file("_1.cfs", &[3u8; 2048], 0);
        leader.add_index_file("segments_4", &[4u8; 16], 0);
        let host = Arc::new(RecordingHost::open(dir.path()));
        host.seed(CommitPoint::new(1, 1)).await;
        let client = Arc::new(ReplicationClient::new(leader.clone(), host).unwrap());

        let state = Arc::new(AppState {
            node_id: "follower-1".into(),
            client,
            poll: poll.then(|| Arc::new(PollControl::new(Duration::from_secs(60)))),
        });
        TestApi {
            _dir: dir,
            leader,
            state,
        }
    }

    async fn call(state: &Arc<AppState>, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = HttpServer::create_router(state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn wait_idle(state: &AppState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.client.is_busy() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_health() {
        let api = test_api(false).await;
        let (status, body) = call(&api.state, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        assert_eq!(body["node_id"], "follower-1");
        assert_eq!(body["replicating"], false);
    }

    #[tokio::test]
    async fn test_fetch_then_status() {
        let api = test_api(true).await;

        let (status, body) = call(&api.state, "POST", "/replication/fetch").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);
        wait_idle(&api.state).await;

        let (status, body) = call(&api.state, "GET", "/replication/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["leader"], "mock://leader");
        assert_eq!(body["local"]["version"], 4);
        assert_eq!(body["last_cycle"]["result"], "installed");
        assert_eq!(body["history"]["timesIndexReplicated"], 1);
        assert_eq!(body["polling"]["disabled"], false);
        assert!(body["session"].is_null());
    }

    #[tokio::test]
    async fn test_fetch_conflict_and_abort() {
        let api = test_api(false).await;
        let gate = api.leader.hold();

        let (status, _) = call(&api.state, "POST", "/replication/fetch").await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = call(&api.state, "POST", "/replication/fetch").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (_, body) = call(&api.state, "POST", "/replication/abort").await;
        assert_eq!(body["success"], true);

        gate.notify_one();
        wait_idle(&api.state).await;

        let (_, body) = call(&api.state, "GET", "/replication/status").await;
        assert_eq!(body["last_cycle"]["result"], "aborted");

        let (_, body) = call(&api.state, "POST", "/replication/abort").await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_poll_toggles() {
        let api = test_api(true).await;

        let (status, _) = call(&api.state, "POST", "/replication/poll/disable").await;
        assert_eq!(status, StatusCode::OK);
        assert!(api.state.poll.as_ref().unwrap().is_disabled());

        let (status, _) = call(&api.state, "POST", "/replication/poll/enable").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!api.state.poll.as_ref().unwrap().is_disabled());

        let api = test_api(false).await;
        let (status, body) = call(&api.state, "POST", "/replication/poll/disable").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }
}
