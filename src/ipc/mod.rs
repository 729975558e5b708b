mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::supervisor::Supervisor;

/// Longest console line accepted by `POST /api/server/input`
pub const MAX_INPUT_LINE_LEN: usize = 255;

/// IPC 요청 타입
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStartRequest {
    /// Artifact file name inside the server directory
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub launch_args: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRequest {
    pub input_line: String,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub async fn start(self) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = router(self.clone());

        // TCP 리스너
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// Build the IPC router. Split out of [`IPCServer::start`] so it can be driven
/// without a socket.
pub fn router(state: IPCServer) -> Router {
    Router::new()
        .route("/api/server/status", get(handlers::server::status_handler))
        .route("/api/server/start", post(handlers::server::start_handler))
        .route("/api/server/stop", post(handlers::server::stop_handler))
        .route("/api/server/input", post(handlers::server::input_handler))
        .route("/api/server/console", get(handlers::server::console_handler))
        .route("/api/server/status/stream", get(handlers::stream::status_stream_handler))
        .route("/api/server/console/stream", get(handlers::stream::console_stream_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
