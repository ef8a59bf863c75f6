//! 서버 상태 판정 — 파일시스템 휴리스틱, 외부 오버라이드, 로컬 프로세스
//! 핸들, 마지막 종료 코드를 하나의 상태로 합치는 단일 판정 함수.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// 웹 UI에 노출되는 서버 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    NewSetup,
    Pending,
    Running,
    Stopped,
    Error,
}

/// 동반 플러그인이 보고한 외부 상태 오버라이드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalStatus {
    Pending,
    Running,
}

/// Files that may exist in a server directory that has never been set up.
const PLACEHOLDER_FILES: &[&str] = &["eula.txt"];

/// 작업 디렉토리가 한 번도 설치되지 않은 상태인지 판정합니다.
/// 디렉토리가 없거나, EULA 마커 같은 플레이스홀더 파일만 있으면 true.
pub fn is_fresh_install(working_dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(working_dir) else {
        return true;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !PLACEHOLDER_FILES.contains(&name.as_ref()) {
            return false;
        }
    }
    true
}

/// 상태 판정 — 검사 순서가 의미를 가집니다.
///
/// 1. 미설치 디렉토리는 다른 모든 신호에 우선한다 (NEW_SETUP)
/// 2. 외부 오버라이드가 있으면 그대로 매핑한다 (PENDING/RUNNING)
/// 3. 살아있는 핸들 + 종료 코드 없음 → RUNNING
/// 4. 핸들 없음 + 0이 아닌 종료 코드 → ERROR
/// 5. 그 외 → STOPPED
pub fn resolve(
    working_dir: &Path,
    live: bool,
    external: Option<ExternalStatus>,
    last_exit_code: Option<i32>,
) -> ServerStatus {
    if is_fresh_install(working_dir) {
        return ServerStatus::NewSetup;
    }
    if let Some(external) = external {
        return match external {
            ExternalStatus::Pending => ServerStatus::Pending,
            ExternalStatus::Running => ServerStatus::Running,
        };
    }
    if live && last_exit_code.is_none() {
        return ServerStatus::Running;
    }
    if !live {
        if let Some(code) = last_exit_code {
            if code != 0 {
                return ServerStatus::Error;
            }
        }
    }
    ServerStatus::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn initialized_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("server.jar"), b"jar").unwrap();
        dir
    }

    #[test]
    fn test_missing_dir_is_new_setup() {
        let status = resolve(Path::new("/no/such/dir"), false, None, None);
        assert_eq!(status, ServerStatus::NewSetup);
    }

    #[test]
    fn test_placeholder_only_dir_is_new_setup() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("eula.txt"), b"eula=true").unwrap();
        assert_eq!(resolve(dir.path(), false, None, None), ServerStatus::NewSetup);
    }

    /// NEW_SETUP은 외부 오버라이드보다 우선한다
    #[test]
    fn test_new_setup_preempts_override() {
        let dir = TempDir::new().unwrap();
        let status = resolve(dir.path(), false, Some(ExternalStatus::Running), None);
        assert_eq!(status, ServerStatus::NewSetup);
    }

    /// 오버라이드는 로컬 핸들 부재에 우선한다
    #[test]
    fn test_override_wins_without_handle() {
        let dir = initialized_dir();
        let status = resolve(dir.path(), false, Some(ExternalStatus::Running), None);
        assert_eq!(status, ServerStatus::Running);

        let status = resolve(dir.path(), false, Some(ExternalStatus::Pending), Some(1));
        assert_eq!(status, ServerStatus::Pending);
    }

    #[test]
    fn test_live_handle_is_running() {
        let dir = initialized_dir();
        assert_eq!(resolve(dir.path(), true, None, None), ServerStatus::Running);
    }

    #[test]
    fn test_nonzero_exit_is_error() {
        let dir = initialized_dir();
        assert_eq!(resolve(dir.path(), false, None, Some(1)), ServerStatus::Error);
        assert_eq!(resolve(dir.path(), false, None, Some(-9)), ServerStatus::Error);
    }

    #[test]
    fn test_zero_exit_is_stopped() {
        let dir = initialized_dir();
        assert_eq!(resolve(dir.path(), false, None, Some(0)), ServerStatus::Stopped);
        assert_eq!(resolve(dir.path(), false, None, None), ServerStatus::Stopped);
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(serde_json::to_string(&ServerStatus::NewSetup).unwrap(), "\"NEW_SETUP\"");
        assert_eq!(serde_json::to_string(&ServerStatus::Error).unwrap(), "\"ERROR\"");
        assert_eq!(serde_json::to_string(&ExternalStatus::Pending).unwrap(), "\"pending\"");
    }
}
