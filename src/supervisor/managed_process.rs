//! Managed server process - supervisor child spawning with stdio capture
//!
//! 서버 한 대당 수퍼바이저 자식 프로세스 하나를 스폰하고:
//! - stdout/stderr를 한 줄씩 읽어 ANSI 이스케이프 제거 후 LogFile과
//!   배치 버퍼에 같은 순서로 전달
//! - 알려진 로그 마커에서 내부 런타임 PID와 종료 코드를 추출
//! - stdin 커맨드 주입 채널 제공
//! - 프로세스 종료를 감시해 배치 최종 드레인과 슬롯 정리를 수행

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use regex::Regex;

use super::batcher::{self, LogBuffer};
use super::registry::ServerSlot;
use super::state_machine::{Phase, StateMachine};
use crate::events::EventSink;
use crate::logfile::ConsoleLogFile;

/// 내부 런타임(실제 게임 서버)의 PID를 알리는 수퍼바이저 로그 마커
const INNER_PID_PATTERN: &str = r"Server is running at PID (\d+)";
/// 내부 런타임 종료를 알리는 수퍼바이저 로그 마커
const STOP_CODE_PATTERN: &str = r"Server process stopped with code (-?\d+)";
/// CSI 이스케이프 시퀀스 (색상 등)
const ANSI_PATTERN: &str = r"\x1b\[[0-9;?]*[A-Za-z]";

/// 스폰에 필요한 인스턴스 정보
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub server_id: i64,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// 실행 중인 서버 수퍼바이저 프로세스의 핸들.
///
/// 생성은 `start()`, 파괴는 exit-watcher가 담당하며, 서버 id당 동시에
/// 최대 하나만 존재합니다 (레지스트리 슬롯의 start gate가 보장).
pub struct ServerProcessHandle {
    pub server_id: i64,
    /// 수퍼바이저 자식 프로세스 자체의 PID (내부 런타임 PID와 구분)
    pub pid: u32,
    /// 스폰 시각 (unix seconds)
    pub spawned_at: u64,
    stdin_tx: mpsc::Sender<String>,
    running_rx: watch::Receiver<bool>,
    machine: Arc<Mutex<StateMachine>>,
}

impl ServerProcessHandle {
    /// 자식 프로세스를 스폰하고 reader loop / stdin writer / 배치 방출 /
    /// exit-watcher 태스크를 기동합니다.
    ///
    /// 스폰 실패 시 어떤 태스크도 남기지 않고 동기적으로 에러를 반환합니다.
    pub async fn spawn(
        spec: SpawnSpec,
        logfile: ConsoleLogFile,
        buffer: Arc<LogBuffer>,
        slot: Arc<ServerSlot>,
        sink: Arc<dyn EventSink>,
        batch_interval: Duration,
    ) -> Result<Arc<Self>> {
        let mut cmd = TokioCommand::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn '{}': {}", spec.program, e))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned process"))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(256);
        let (running_tx, running_rx) = watch::channel(true);

        let machine = Arc::new(Mutex::new(StateMachine::new()));
        if let Err(e) = machine.lock().unwrap().transition(Phase::Starting) {
            tracing::warn!("Unexpected lifecycle state at spawn: {}", e);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let handle = Arc::new(Self {
            server_id: spec.server_id,
            pid,
            spawned_at: crate::utils::current_timestamp(),
            stdin_tx,
            running_rx,
            machine: machine.clone(),
        });

        // 핸들 설치는 감시 태스크 기동보다 먼저 — 즉시 죽는 프로세스라도
        // exit-watcher의 정리가 설치 이후에 온다.
        slot.begin_lifecycle(handle.clone());

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin_handle) = stdin {
            tokio::spawn(async move {
                while let Some(cmd) = stdin_rx.recv().await {
                    let data = if cmd.ends_with('\n') { cmd } else { format!("{}\n", cmd) };
                    if stdin_handle.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── batch emitter ────────────────────────────────────
        let batch_token = CancellationToken::new();
        let batcher_task = batcher::spawn_batch_task(
            spec.server_id,
            buffer.clone(),
            sink.clone(),
            batch_interval,
            batch_token.clone(),
        );

        // ── reader loop ──────────────────────────────────────
        let reader_task = {
            let slot = slot.clone();
            let machine = machine.clone();
            let server_id = spec.server_id;
            tokio::spawn(async move {
                reader_loop(server_id, stdout, stderr, logfile, buffer, slot, machine).await;
            })
        };

        // ── exit watcher ─────────────────────────────────────
        {
            let sink = sink.clone();
            let server_id = spec.server_id;
            tokio::spawn(async move {
                let wait_code = match child.wait().await {
                    Ok(status) => {
                        tracing::info!("Server {} supervisor exited with {}", server_id, status);
                        status.code()
                    }
                    Err(e) => {
                        tracing::error!("Failed to wait for server {}: {}", server_id, e);
                        None
                    }
                };

                // 파이프에 남은 출력을 reader가 모두 소진한 다음에야
                // 배치를 끊는다
                let _ = reader_task.await;
                batch_token.cancel();
                let _ = batcher_task.await;

                if let Err(e) = machine.lock().unwrap().transition(Phase::Exited) {
                    tracing::warn!("Lifecycle state out of sync at exit: {}", e);
                }
                slot.finish_lifecycle(wait_code);
                let _ = running_tx.send(false);
                sink.notify_status_change(server_id);
            });
        }

        Ok(handle)
    }

    /// stdin으로 한 줄 전송. 파이프가 이미 닫혔으면 에러를 반환하며,
    /// 호출자가 이를 어떻게 다룰지(no-op 또는 "이미 종료 중") 결정합니다.
    pub async fn send_line(&self, text: &str) -> Result<()> {
        self.stdin_tx
            .send(text.to_string())
            .await
            .map_err(|e| anyhow::anyhow!("stdin channel closed: {}", e))
    }

    /// graceful stop 요청 시점에 호출
    pub fn mark_stopping(&self) {
        // Stopping으로 갈 수 없는 단계(이미 Stopping/Exited)는 무시
        let _ = self.machine.lock().unwrap().transition(Phase::Stopping);
    }

    pub fn phase(&self) -> Phase {
        self.machine.lock().unwrap().phase
    }

    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// 종료 감시용 watch 채널 구독
    pub fn running_watch(&self) -> watch::Receiver<bool> {
        self.running_rx.clone()
    }

    /// 프로세스가 끝나고 exit-watcher 정리가 완료될 때까지 대기
    pub async fn wait_for_exit(&self) {
        let mut rx = self.running_rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// stdout/stderr를 함께 읽는 루프. 먼저 읽을 수 있는 스트림이 이기는
/// select이므로 두 스트림 사이의 엄밀한 시간 순서는 보장하지 않습니다
/// (각 스트림 내부 순서는 보장).
async fn reader_loop(
    server_id: i64,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    mut logfile: ConsoleLogFile,
    buffer: Arc<LogBuffer>,
    slot: Arc<ServerSlot>,
    machine: Arc<Mutex<StateMachine>>,
) {
    let cleaner = LineCleaner::new();
    let markers = LineMarkers::new();

    let mut stdout_lines = stdout.map(|s| BufReader::new(s).lines());
    let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());
    let mut out_open = stdout_lines.is_some();
    let mut err_open = stderr_lines.is_some();

    while out_open || err_open {
        let raw = tokio::select! {
            line = next_line(&mut stdout_lines), if out_open => {
                if line.is_none() {
                    out_open = false;
                }
                line
            }
            line = next_line(&mut stderr_lines), if err_open => {
                if line.is_none() {
                    err_open = false;
                }
                line
            }
            else => break,
        };

        let Some(raw) = raw else { continue };
        let Some(cleaned) = cleaner.clean(&raw) else { continue };

        if let Some(ref markers) = markers {
            if let Some(inner_pid) = markers.inner_pid(&cleaned) {
                tracing::info!("Server {} inner runtime PID {}", server_id, inner_pid);
                slot.record_inner_pid(inner_pid);
                let _ = machine.lock().unwrap().transition(Phase::Running);
            }
            if let Some(code) = markers.stop_code(&cleaned) {
                tracing::info!("Server {} inner runtime stopped with code {}", server_id, code);
                slot.record_reported_exit(code);
            }
        }

        // 감사 로그는 best-effort — 라이브 스트리밍을 죽이지 않는다
        if let Err(e) = logfile.write_line(&cleaned) {
            tracing::warn!("Failed to write console log for server {}: {}", server_id, e);
        }
        buffer.push(cleaned);
    }

    logfile.close();
    tracing::debug!("Reader loop for server {} finished", server_id);
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(l) => l.next_line().await.ok().flatten(),
        None => None,
    }
}

// ─── Line cleanup ────────────────────────────────────────────

/// ANSI 제거 + 프롬프트 잔재 제거
struct LineCleaner {
    ansi: Option<Regex>,
}

impl LineCleaner {
    fn new() -> Self {
        Self {
            ansi: Regex::new(ANSI_PATTERN).ok(),
        }
    }

    /// 정리된 줄을 반환합니다. 빈 줄과 순수 REPL 프롬프트 잔재(`>` 만
    /// 있는 줄)는 None.
    fn clean(&self, raw: &str) -> Option<String> {
        let stripped = match &self.ansi {
            Some(re) => re.replace_all(raw, "").into_owned(),
            None => raw.to_string(),
        };
        let line = stripped.trim_end_matches(['\r', '\n']).to_string();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.chars().all(|c| c == '>') {
            return None;
        }
        Some(line)
    }
}

/// 수퍼바이저 출력에서 인식하는 두 가지 마커
struct LineMarkers {
    inner_pid: Regex,
    stop_code: Regex,
}

impl LineMarkers {
    fn new() -> Option<Self> {
        let inner_pid = match Regex::new(INNER_PID_PATTERN) {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!("Invalid PID marker pattern: {}", e);
                return None;
            }
        };
        let stop_code = match Regex::new(STOP_CODE_PATTERN) {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!("Invalid stop marker pattern: {}", e);
                return None;
            }
        };
        Some(Self { inner_pid, stop_code })
    }

    fn inner_pid(&self, line: &str) -> Option<u32> {
        self.inner_pid
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    fn stop_code(&self, line: &str) -> Option<i32> {
        self.stop_code
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

// ─── Force kill ──────────────────────────────────────────────

/// PID로 프로세스를 강제 종료합니다. 크로스 플랫폼.
///
/// 이미 사라진 프로세스는 성공으로 취급하고, 권한 거부만 실패로
/// 보고합니다 — 운영자가 수동 개입해야 하는 유일한 경우이기 때문입니다.
pub fn force_kill_pid(pid: u32) -> Result<(), super::error::SupervisorError> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) => {
                Err(super::error::SupervisorError::KillPermissionDenied { pid })
            }
            Err(e) => Err(super::error::SupervisorError::Internal(anyhow::anyhow!(
                "Failed to kill PID {}: {}",
                pid,
                e
            ))),
        }
    }

    #[cfg(windows)]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                // 이미 사라졌거나 열 수 없는 경우 — 사라진 것으로 취급
                return Ok(());
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(super::error::SupervisorError::KillPermissionDenied { pid });
            }
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────
