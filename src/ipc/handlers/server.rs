use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::collections::HashMap;

use super::super::IPCServer;
use crate::supervisor::error::SupervisorError;

/// GET /api/servers — 모든 서버 목록 (상태 포함)
pub async fn list_servers(State(state): State<IPCServer>) -> impl IntoResponse {
    let mut servers = Vec::new();
    for instance in state.supervisor.instances.list() {
        if let Some(detail) = state.broadcaster.server_detail(instance.id) {
            servers.push(detail);
        }
    }
    Json(json!({ "servers": servers }))
}

/// GET /api/server/:id/status — 상태 폴링
pub async fn get_server_status(
    Path(id): Path<i64>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let (status, exit_code) = state.supervisor.get_status(id)?;
    Ok(Json(json!({
        "server": id,
        "status": status,
        "exit_code": exit_code,
    })))
}

/// POST /api/server/:id/start — 서버 시작
pub async fn start_server(
    Path(id): Path<i64>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let pid = state.supervisor.start(id).await?;
    Ok(Json(json!({
        "success": true,
        "server": id,
        "pid": pid,
    })))
}

/// POST /api/server/:id/stop — graceful stop 요청
pub async fn stop_server(
    Path(id): Path<i64>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.stop(id).await?;
    Ok(Json(json!({ "success": true, "server": id })))
}

/// POST /api/server/:id/restart — 재시작
pub async fn restart_server(
    Path(id): Path<i64>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let pid = state.supervisor.restart(id).await?;
    Ok(Json(json!({
        "success": true,
        "server": id,
        "pid": pid,
    })))
}

/// POST /api/server/:id/kill — 강제 종료
pub async fn kill_server(
    Path(id): Path<i64>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.force_kill(id).await?;
    Ok(Json(json!({ "success": true, "server": id })))
}

/// POST /api/server/:id/command — 콘솔 입력 전달
pub async fn send_command(
    Path(id): Path<i64>,
    State(state): State<IPCServer>,
    payload: Option<Json<serde_json::Value>>,
) -> Result<impl IntoResponse, SupervisorError> {
    let payload = payload.map(|j| j.0).unwrap_or(json!({}));
    let Some(command) = payload.get("command").and_then(|v| v.as_str()) else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing 'command' field" })),
        )
            .into_response());
    };

    state.supervisor.send_command(id, command).await?;
    Ok(Json(json!({ "success": true })).into_response())
}

/// GET /api/server/:id/logs?limit=500 — 과거 콘솔 로그
pub async fn get_logs(
    Path(id): Path<i64>,
    State(state): State<IPCServer>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, SupervisorError> {
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(500);

    let logs = state.supervisor.get_historical_logs(id, limit)?;
    Ok(Json(json!({ "server": id, "logs": logs })))
}
