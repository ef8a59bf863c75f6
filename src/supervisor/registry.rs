//! Process registry — 서버 id별 수명주기 상태의 단일 소유자.
//!
//! 전역 딕셔너리 대신 주입 가능한 레지스트리 객체가 per-id 슬롯을 소유합니다.
//! 슬롯 삽입은 `start`(begin_lifecycle), 제거는 exit-watcher
//! (finish_lifecycle)만 수행합니다. 동일 id에 대한 동시 `start`는 슬롯의
//! start gate로 직렬화되고, 서로 다른 서버끼리는 전혀 직렬화되지 않습니다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::managed_process::ServerProcessHandle;
use super::status::ExternalStatus;

/// 레지스트리 — 서버 id → 슬롯
pub struct ProcessRegistry {
    slots: Mutex<HashMap<i64, Arc<ServerSlot>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// id의 슬롯을 가져오거나 생성합니다.
    pub fn slot(&self, server_id: i64) -> Arc<ServerSlot> {
        let mut slots = self.slots.lock().unwrap();
        slots
            .entry(server_id)
            .or_insert_with(|| Arc::new(ServerSlot::new(server_id)))
            .clone()
    }

    /// 생성 없이 조회만 합니다.
    pub fn get(&self, server_id: i64) -> Option<Arc<ServerSlot>> {
        self.slots.lock().unwrap().get(&server_id).cloned()
    }

    /// 현재 상태의 읽기 스냅샷. 슬롯이 없으면 빈 스냅샷.
    pub fn snapshot(&self, server_id: i64) -> SlotSnapshot {
        self.get(server_id)
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    /// 살아있는 핸들을 가진 서버 id 목록
    pub fn running_ids(&self) -> Vec<i64> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, slot)| slot.is_live())
            .map(|(id, _)| *id)
            .collect()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 서버 한 대의 수명주기 상태.
pub struct ServerSlot {
    pub server_id: i64,
    /// 같은 id에 대한 check-then-spawn을 원자적으로 만드는 게이트
    start_gate: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    handle: Option<Arc<ServerProcessHandle>>,
    inner_pid: Option<u32>,
    last_exit_code: Option<i32>,
    external: Option<ExternalStatus>,
    /// exit-watcher가 오버라이드를 지운 뒤 true — 다음 start까지
    /// 뒤늦게 도착한 외부 보고를 무시합니다 (exit wins, clear is sticky).
    exit_latched: bool,
}

/// 상태 판정과 상세 페이로드에 쓰이는 읽기 스냅샷
#[derive(Debug, Clone, Default)]
pub struct SlotSnapshot {
    pub live: bool,
    pub pid: Option<u32>,
    pub inner_pid: Option<u32>,
    pub external: Option<ExternalStatus>,
    pub last_exit_code: Option<i32>,
    pub spawned_at: Option<u64>,
}

impl ServerSlot {
    fn new(server_id: i64) -> Self {
        Self {
            server_id,
            start_gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(SlotState::default()),
        }
    }

    /// start 경로 전용 게이트
    pub fn start_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.start_gate
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().unwrap().handle.is_some()
    }

    pub fn handle(&self) -> Option<Arc<ServerProcessHandle>> {
        self.state.lock().unwrap().handle.clone()
    }

    /// 새 수명주기 시작 — 핸들 설치, 이전 종료 코드/내부 PID 리셋,
    /// 낙관적 PENDING 오버라이드 설정, late-message 래치 해제.
    pub fn begin_lifecycle(&self, handle: Arc<ServerProcessHandle>) {
        let mut state = self.state.lock().unwrap();
        state.handle = Some(handle);
        state.inner_pid = None;
        state.last_exit_code = None;
        state.external = Some(ExternalStatus::Pending);
        state.exit_latched = false;
    }

    /// exit-watcher 전용 — 핸들 제거, 오버라이드 클리어, 종료 코드 확정.
    ///
    /// 수명주기 도중 마커나 플러그인 보고로 기록된 코드가 있으면 그것이
    /// OS wait 결과보다 우선합니다.
    pub fn finish_lifecycle(&self, wait_code: Option<i32>) {
        let mut state = self.state.lock().unwrap();
        state.handle = None;
        state.last_exit_code = state.last_exit_code.or(wait_code);
        state.external = None;
        state.exit_latched = true;
    }

    /// 외부 오버라이드 설정. 래치가 걸려 있으면(종료 후 늦게 온 보고)
    /// 버리고 false를 반환합니다.
    pub fn set_external(&self, status: ExternalStatus) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.exit_latched {
            return false;
        }
        state.external = Some(status);
        true
    }

    /// 마커/플러그인이 보고한 내부 런타임 종료 코드 기록
    pub fn record_reported_exit(&self, code: i32) {
        self.state.lock().unwrap().last_exit_code = Some(code);
    }

    /// 로그 마커에서 추출한 내부 런타임 PID 기록
    pub fn record_inner_pid(&self, pid: u32) {
        self.state.lock().unwrap().inner_pid = Some(pid);
    }

    pub fn inner_pid(&self) -> Option<u32> {
        self.state.lock().unwrap().inner_pid
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        let state = self.state.lock().unwrap();
        SlotSnapshot {
            live: state.handle.is_some(),
            pid: state.handle.as_ref().map(|h| h.pid),
            inner_pid: state.inner_pid,
            external: state.external,
            last_exit_code: state.last_exit_code,
            spawned_at: state.handle.as_ref().map(|h| h.spawned_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_created_on_demand() {
        let registry = ProcessRegistry::new();
        assert!(registry.get(1).is_none());
        let slot = registry.slot(1);
        assert_eq!(slot.server_id, 1);
        assert!(registry.get(1).is_some());
        // 같은 id는 같은 슬롯
        assert!(Arc::ptr_eq(&slot, &registry.slot(1)));
    }

    #[test]
    fn test_empty_snapshot() {
        let registry = ProcessRegistry::new();
        let snap = registry.snapshot(42);
        assert!(!snap.live);
        assert!(snap.external.is_none());
        assert!(snap.last_exit_code.is_none());
    }

    #[test]
    fn test_external_before_any_start_is_accepted() {
        // 외부에서 먼저 기동된 서버 — 로컬 핸들 없이도 오버라이드 허용
        let registry = ProcessRegistry::new();
        let slot = registry.slot(3);
        assert!(slot.set_external(ExternalStatus::Running));
        assert_eq!(slot.snapshot().external, Some(ExternalStatus::Running));
    }

    #[test]
    fn test_finish_clears_override_and_latches() {
        let registry = ProcessRegistry::new();
        let slot = registry.slot(1);
        slot.set_external(ExternalStatus::Running);

        slot.finish_lifecycle(Some(0));
        let snap = slot.snapshot();
        assert!(snap.external.is_none());
        assert_eq!(snap.last_exit_code, Some(0));

        // 종료 후 뒤늦게 도착한 "running" 보고는 상태를 되살리지 못한다
        assert!(!slot.set_external(ExternalStatus::Running));
        assert!(slot.snapshot().external.is_none());
    }

    #[test]
    fn test_reported_exit_code_wins_over_wait_code() {
        let registry = ProcessRegistry::new();
        let slot = registry.slot(1);
        slot.record_reported_exit(137);
        slot.finish_lifecycle(Some(0));
        assert_eq!(slot.snapshot().last_exit_code, Some(137));
    }

    #[test]
    fn test_wait_code_used_when_no_report() {
        let registry = ProcessRegistry::new();
        let slot = registry.slot(1);
        slot.finish_lifecycle(Some(1));
        assert_eq!(slot.snapshot().last_exit_code, Some(1));
    }

    #[test]
    fn test_inner_pid_roundtrip() {
        let registry = ProcessRegistry::new();
        let slot = registry.slot(9);
        assert!(slot.inner_pid().is_none());
        slot.record_inner_pid(4321);
        assert_eq!(slot.inner_pid(), Some(4321));
    }
}
