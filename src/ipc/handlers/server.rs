use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::super::{IPCServer, InputRequest, ServerStartRequest, MAX_INPUT_LINE_LEN};

#[derive(Debug, Deserialize)]
pub struct ConsoleQuery {
    pub since: Option<u64>,
}

/// GET /api/server/status - 서버 상태 조회
pub async fn status_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    Json(state.supervisor.report())
}

/// POST /api/server/start - body is optional
pub async fn start_handler(
    State(state): State<IPCServer>,
    payload: Option<Json<ServerStartRequest>>,
) -> impl IntoResponse {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let launch_args = request
        .launch_args
        .unwrap_or_else(|| state.supervisor.config().launch_args.clone());

    match state
        .supervisor
        .start(request.artifact.as_deref(), &launch_args)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::warn!("Start request failed: {}", e);
            e.into_response()
        }
    }
}

/// POST /api/server/stop
pub async fn stop_handler(State(state): State<IPCServer>) -> impl IntoResponse {
    match state.supervisor.stop().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/server/input - Send one line to the server console
pub async fn input_handler(
    State(state): State<IPCServer>,
    Json(payload): Json<InputRequest>,
) -> impl IntoResponse {
    let line = payload.input_line;
    if line.chars().count() > MAX_INPUT_LINE_LEN {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("input_line is longer than {} characters", MAX_INPUT_LINE_LEN),
                "error_code": "INPUT_TOO_LONG",
            })),
        )
            .into_response();
    }
    if line.contains('\n') || line.contains('\r') {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "input_line must be a single line",
                "error_code": "INPUT_MULTILINE",
            })),
        )
            .into_response();
    }

    match state.supervisor.input_line(&line).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/server/console?since=ID - Console transcript
pub async fn console_handler(
    State(state): State<IPCServer>,
    Query(params): Query<ConsoleQuery>,
) -> impl IntoResponse {
    let lines = match params.since {
        Some(id) => state.supervisor.console_since(id),
        None => state.supervisor.recent_output(),
    };
    Json(json!({
        "state": state.supervisor.status(),
        "last_id": state.supervisor.last_console_id(),
        "lines": lines,
    }))
}
