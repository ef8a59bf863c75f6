//! Process supervisor — 서버 id당 정확히 하나의 수퍼바이저 자식 프로세스를
//! 스폰/감시/종료하는 파사드.
//!
//! 전역 상태 없이 주입된 레지스트리/인스턴스 저장소/이벤트 싱크 위에서
//! 동작하며, IPC 핸들러가 호출하는 모든 수명주기 연산을 노출합니다.

pub mod batcher;
pub mod error;
pub mod managed_process;
pub mod registry;
pub mod state_machine;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use self::batcher::LogBuffer;
use self::error::SupervisorError;
use self::managed_process::{force_kill_pid, ServerProcessHandle, SpawnSpec};
use self::registry::ProcessRegistry;
use self::status::ServerStatus;

use crate::config::{ConsoleLogConfig, GlobalConfig};
use crate::events::EventSink;
use crate::instance::InstanceStore;
use crate::logfile::{self, ConsoleLogFile};

pub struct Supervisor {
    pub registry: Arc<ProcessRegistry>,
    pub instances: Arc<InstanceStore>,
    sink: Arc<dyn EventSink>,
    log_config: ConsoleLogConfig,
    batch_interval: Duration,
    restart_grace: Duration,
}

impl Supervisor {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        instances: Arc<InstanceStore>,
        sink: Arc<dyn EventSink>,
        config: &GlobalConfig,
    ) -> Self {
        Self {
            registry,
            instances,
            sink,
            log_config: config.console_log.clone(),
            batch_interval: Duration::from_millis(config.batch.interval_ms),
            restart_grace: Duration::from_secs(config.process.restart_grace_secs),
        }
    }

    /// 서버 시작. 성공 시 수퍼바이저 자식의 PID를 반환합니다.
    ///
    /// 이미 살아있는 핸들이 있으면 `AlreadyRunning` — 두 번째 핸들은
    /// 어떤 경우에도 만들어지지 않습니다. 스폰 실패는 동기적으로
    /// 반환되며 부분 상태를 남기지 않습니다.
    pub async fn start(&self, server_id: i64) -> Result<u32, SupervisorError> {
        let instance = self
            .instances
            .get(server_id)
            .ok_or(SupervisorError::InstanceNotFound(server_id))?;
        if instance.launch_command.is_empty() {
            return Err(SupervisorError::NoLaunchCommand(server_id));
        }

        let slot = self.registry.slot(server_id);
        // check-then-spawn을 id 단위로 직렬화 — 다른 서버와는 무관
        let _gate = slot.start_gate().lock().await;
        if slot.is_live() {
            return Err(SupervisorError::AlreadyRunning(server_id));
        }
        if !instance.working_dir.is_dir() {
            return Err(SupervisorError::SpawnFailed(
                server_id,
                format!("working directory {} does not exist", instance.working_dir.display()),
            ));
        }

        let logfile = ConsoleLogFile::open(&instance.working_dir, self.log_config.clone())
            .map_err(|e| {
                SupervisorError::SpawnFailed(server_id, format!("failed to open console log: {}", e))
            })?;

        let spec = SpawnSpec {
            server_id,
            program: instance.launch_command[0].clone(),
            args: instance.launch_command[1..].to_vec(),
            working_dir: instance.working_dir.clone(),
        };
        let handle = ServerProcessHandle::spawn(
            spec,
            logfile,
            Arc::new(LogBuffer::new()),
            slot.clone(),
            self.sink.clone(),
            self.batch_interval,
        )
        .await
        .map_err(|e| SupervisorError::SpawnFailed(server_id, e.to_string()))?;

        let pid = handle.pid;
        tracing::info!("Server {} started, supervisor PID {}", server_id, pid);
        self.sink.notify_status_change(server_id);
        Ok(pid)
    }

    /// graceful stop 요청 — stdin으로 종료 명령을 보냅니다.
    ///
    /// 살아있는 핸들이 없으면 이미 정지된 것으로 보고 성공합니다 (멱등).
    /// stdin이 이미 닫혀 있으면 "이미 종료 중"으로 취급하고 에러를
    /// 전파하지 않습니다.
    pub async fn stop(&self, server_id: i64) -> Result<(), SupervisorError> {
        let instance = self
            .instances
            .get(server_id)
            .ok_or(SupervisorError::InstanceNotFound(server_id))?;

        let Some(handle) = self.registry.get(server_id).and_then(|s| s.handle()) else {
            tracing::debug!("Stop requested for server {} with no live handle", server_id);
            return Ok(());
        };

        handle.mark_stopping();
        tracing::info!("Requesting graceful stop of server {}", server_id);
        if let Err(e) = handle.send_line(&instance.stop_command).await {
            tracing::warn!(
                "Stdin closed while stopping server {} ({}), treating as already stopping",
                server_id,
                e
            );
        }
        Ok(())
    }

    /// stop 후 유예 시간 안에 종료가 관찰되면(또는 유예가 지나면) start.
    ///
    /// 유예가 지나도 프로세스가 살아 있으면 start가 `AlreadyRunning`으로
    /// 실패합니다 — 무한정 블로킹하지 않습니다.
    pub async fn restart(&self, server_id: i64) -> Result<u32, SupervisorError> {
        self.stop(server_id).await?;

        if let Some(handle) = self.registry.get(server_id).and_then(|s| s.handle()) {
            if tokio::time::timeout(self.restart_grace, handle.wait_for_exit())
                .await
                .is_err()
            {
                tracing::warn!(
                    "Server {} did not exit within {:?} grace, proceeding to start",
                    server_id,
                    self.restart_grace
                );
            }
        }

        self.start(server_id).await
    }

    /// 강제 종료 — 추적된 내부 런타임 PID와 수퍼바이저 프로세스 양쪽에
    /// 킬 시그널을 보냅니다. "이미 사라짐"은 성공, 권한 거부만 실패.
    pub async fn force_kill(&self, server_id: i64) -> Result<(), SupervisorError> {
        self.instances
            .get(server_id)
            .ok_or(SupervisorError::InstanceNotFound(server_id))?;

        let Some(slot) = self.registry.get(server_id) else {
            return Ok(());
        };
        if let Some(inner_pid) = slot.inner_pid() {
            tracing::info!("Force killing inner runtime PID {} of server {}", inner_pid, server_id);
            force_kill_pid(inner_pid)?;
        }
        if let Some(handle) = slot.handle() {
            tracing::info!("Force killing supervisor PID {} of server {}", handle.pid, server_id);
            force_kill_pid(handle.pid)?;
        }
        Ok(())
    }

    /// 콘솔 입력 전달 (CommandSink). 서버가 떠 있지 않으면 조용히
    /// no-op입니다 — 보장이 필요한 호출자는 먼저 상태를 확인해야 합니다.
    pub async fn send_command(&self, server_id: i64, text: &str) -> Result<(), SupervisorError> {
        self.instances
            .get(server_id)
            .ok_or(SupervisorError::InstanceNotFound(server_id))?;

        match self.registry.get(server_id).and_then(|s| s.handle()) {
            Some(handle) => {
                if let Err(e) = handle.send_line(text).await {
                    tracing::debug!("Command for server {} dropped: {}", server_id, e);
                }
            }
            None => {
                tracing::debug!("Command for stopped server {} dropped", server_id);
            }
        }
        Ok(())
    }

    /// 상태 질의 — REST 폴링과 브로드캐스터 푸시가 함께 쓰는 경로.
    pub fn get_status(&self, server_id: i64) -> Result<(ServerStatus, Option<i32>), SupervisorError> {
        let instance = self
            .instances
            .get(server_id)
            .ok_or(SupervisorError::InstanceNotFound(server_id))?;
        let snap = self.registry.snapshot(server_id);
        let status = status::resolve(
            &instance.working_dir,
            snap.live,
            snap.external,
            snap.last_exit_code,
        );
        Ok((status, snap.last_exit_code))
    }

    /// 과거 콘솔 로그 조회 — 활성 파일 + 최근 아카이브에서 마지막 limit줄.
    pub fn get_historical_logs(
        &self,
        server_id: i64,
        limit: usize,
    ) -> Result<Vec<String>, SupervisorError> {
        let instance = self
            .instances
            .get(server_id)
            .ok_or(SupervisorError::InstanceNotFound(server_id))?;
        let (active, archive) = logfile::log_paths(&instance.working_dir);
        Ok(logfile::read_tail_at(&active, &archive, limit))
    }

    /// 데몬 종료 시 모든 라이브 서버에 graceful stop 요청
    pub async fn stop_all(&self) {
        for server_id in self.registry.running_ids() {
            if let Err(e) = self.stop(server_id).await {
                tracing::warn!("Failed to request stop of server {}: {}", server_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ServerInstance;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct NullSink {
        changes: Mutex<Vec<i64>>,
    }

    impl EventSink for NullSink {
        fn notify_status_change(&self, server_id: i64) {
            self.changes.lock().unwrap().push(server_id);
        }
        fn emit_log_batch(&self, _server_id: i64, _lines: Vec<String>) {}
    }

    fn supervisor_with(instances: Vec<ServerInstance>) -> Supervisor {
        let store = Arc::new(InstanceStore::new("/nonexistent/instances.json"));
        for inst in instances {
            let _ = store.add(inst);
        }
        Supervisor::new(
            Arc::new(ProcessRegistry::new()),
            store,
            Arc::new(NullSink::default()),
            &GlobalConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_start_unknown_instance() {
        let sup = supervisor_with(vec![]);
        let err = sup.start(1).await.unwrap_err();
        assert!(matches!(err, SupervisorError::InstanceNotFound(1)));
    }

    #[tokio::test]
    async fn test_start_without_launch_command() {
        let sup = supervisor_with(vec![ServerInstance::new(1, "srv", Path::new("/tmp"))]);
        let err = sup.start(1).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NoLaunchCommand(1)));
    }

    #[tokio::test]
    async fn test_start_missing_working_dir_is_spawn_failure() {
        let mut inst = ServerInstance::new(1, "srv", Path::new("/no/such/dir"));
        inst.launch_command = vec!["true".to_string()];
        let sup = supervisor_with(vec![inst]);

        let err = sup.start(1).await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed(1, _)));
        // 부분 상태가 남지 않는다
        assert!(!sup.registry.snapshot(1).live);
    }

    /// P2: 살아있는 핸들이 없는 stop은 몇 번을 불러도 성공
    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let sup = supervisor_with(vec![ServerInstance::new(1, "srv", Path::new("/tmp"))]);
        for _ in 0..3 {
            assert!(sup.stop(1).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_send_command_when_stopped_is_noop() {
        let sup = supervisor_with(vec![ServerInstance::new(1, "srv", Path::new("/tmp"))]);
        assert!(sup.send_command(1, "say hello").await.is_ok());
    }

    #[tokio::test]
    async fn test_force_kill_without_slot_is_ok() {
        let sup = supervisor_with(vec![ServerInstance::new(1, "srv", Path::new("/tmp"))]);
        assert!(sup.force_kill(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_of_fresh_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let sup = supervisor_with(vec![ServerInstance::new(1, "srv", dir.path())]);
        let (status, code) = sup.get_status(1).unwrap();
        assert_eq!(status, ServerStatus::NewSetup);
        assert!(code.is_none());
    }

    #[tokio::test]
    async fn test_historical_logs_of_never_started_server() {
        let dir = tempfile::TempDir::new().unwrap();
        let sup = supervisor_with(vec![ServerInstance::new(1, "srv", dir.path())]);
        assert!(sup.get_historical_logs(1, 100).unwrap().is_empty());
    }
}
