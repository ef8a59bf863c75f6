use serde::Deserialize;

/// 데몬 전역 설정 — config/global.toml
///
/// 모든 필드에 기본값이 있으므로 파일이 없어도 데몬은 기동합니다.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    /// IPC HTTP 서버 리슨 주소
    pub ipc_listen: String,
    /// 플러그인 게이트웨이(TCP) 리슨 주소
    pub gateway_listen: String,
    /// 인스턴스 저장 파일 경로
    pub instances_file: String,
    pub console_log: ConsoleLogConfig,
    pub batch: BatchConfig,
    pub process: ProcessConfig,
}

/// 콘솔 로그 로테이션/보존 설정
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConsoleLogConfig {
    /// 이 크기(바이트) 이상이면 활성 로그를 아카이브로 회전
    pub rotate_bytes: u64,
    /// 보존할 아카이브 최대 개수
    pub retention_count: usize,
    /// 보존할 아카이브 최대 일수
    pub retention_days: u64,
}

/// 로그 배치 방출 설정
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BatchConfig {
    /// 배치 창 간격 (밀리초)
    pub interval_ms: u64,
}

/// 프로세스 수명주기 설정
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ProcessConfig {
    /// restart 시 graceful stop을 기다리는 최대 시간 (초)
    pub restart_grace_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            ipc_listen: "127.0.0.1:57474".to_string(),
            gateway_listen: "127.0.0.1:57475".to_string(),
            instances_file: "instances.json".to_string(),
            console_log: ConsoleLogConfig::default(),
            batch: BatchConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

impl Default for ConsoleLogConfig {
    fn default() -> Self {
        Self {
            rotate_bytes: 1024 * 1024,
            retention_count: 20,
            retention_days: 30,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { interval_ms: 200 }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self { restart_grace_secs: 10 }
    }
}

impl GlobalConfig {
    pub fn load() -> anyhow::Result<Self> {
        let s = std::fs::read_to_string("config/global.toml").unwrap_or_default();
        let cfg: Self = toml::from_str(&s).unwrap_or_default();
        Ok(cfg)
    }
}
