//! Supervisor 전용 에러 타입 — 에러 종류를 구분하여 IPC 핸들러에서
//! 적절한 HTTP 상태 코드를 반환할 수 있게 합니다.

use axum::http::StatusCode;

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Instance '{0}' not found")]
    InstanceNotFound(i64),

    #[error("Server '{0}' is already running")]
    AlreadyRunning(i64),

    #[error("Failed to spawn server '{0}': {1}")]
    SpawnFailed(i64, String),

    #[error("No launch command configured for server '{0}'")]
    NoLaunchCommand(i64),

    #[error("Permission denied killing process {pid}")]
    KillPermissionDenied { pid: u32 },

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyRunning(_) => StatusCode::CONFLICT,
            Self::NoLaunchCommand(_) => StatusCode::BAD_REQUEST,
            Self::SpawnFailed(_, _) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::KillPermissionDenied { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::SpawnFailed(_, _) => "SPAWN_FAILED",
            Self::NoLaunchCommand(_) => "NO_LAUNCH_COMMAND",
            Self::KillPermissionDenied { .. } => "KILL_PERMISSION_DENIED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

/// axum 핸들러에서 SupervisorError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(SupervisorError::AlreadyRunning(1).status_code(), StatusCode::CONFLICT);
        assert_eq!(SupervisorError::InstanceNotFound(1).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            SupervisorError::KillPermissionDenied { pid: 42 }.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_json() {
        let err = SupervisorError::AlreadyRunning(5);
        let json = err.to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "ALREADY_RUNNING");
    }
}
