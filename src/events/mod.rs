//! Event fan-out — 상태 변경/로그 배치를 웹 구독자 룸으로, 화이트리스트
//! 이벤트를 그룹 멤버십이 겹치는 플러그인 커넥션으로 중계합니다.
//!
//! Supervisor와 tracker는 전역 싱글턴 대신 주입된 `EventSink` 능력
//! 객체만 쥐며, 테스트는 기록용 싱크로 대체합니다.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::gateway::{self, PluginRegistry};
use crate::instance::InstanceStore;
use crate::supervisor::registry::ProcessRegistry;
use crate::supervisor::status;

/// Supervisor/tracker가 이벤트를 내보낼 때 쓰는 능력 인터페이스
pub trait EventSink: Send + Sync {
    /// 서버 상태가 바뀌었을 수 있음 — 싱크가 상세를 재계산해 방출
    fn notify_status_change(&self, server_id: i64);
    /// 한 배치 창에서 모인 콘솔 줄 방출 (순서 보존)
    fn emit_log_batch(&self, server_id: i64, lines: Vec<String>);
}

/// 플러그인 커넥션으로 중계되는 이벤트 화이트리스트
pub const RELAY_EVENTS: &[&str] = &[
    gateway::EVENT_STARTUP,
    gateway::EVENT_STOP,
    gateway::EVENT_PLAYER_JOINED,
    gateway::EVENT_PLAYER_LEFT,
    gateway::EVENT_USER_INFO,
];

/// 웹소켓으로 나가는 이벤트 한 건
#[derive(Debug, Clone, Serialize)]
pub struct WsEvent {
    pub event: String,
    pub data: Value,
}

impl WsEvent {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }

    /// 웹소켓 텍스트 프레임으로 직렬화
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// 룸 단위 웹 fan-out + 그룹 단위 플러그인 릴레이.
///
/// 웹 전달과 플러그인 전달은 독립된 실패 도메인입니다 — 한쪽 소켓의
/// 실패가 다른 쪽 전달을 막거나 떨어뜨리지 않습니다.
pub struct Broadcaster {
    registry: Arc<ProcessRegistry>,
    instances: Arc<InstanceStore>,
    plugins: Arc<PluginRegistry>,
    global_tx: broadcast::Sender<WsEvent>,
    rooms: Mutex<HashMap<i64, broadcast::Sender<WsEvent>>>,
}

const CHANNEL_CAPACITY: usize = 256;

impl Broadcaster {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        instances: Arc<InstanceStore>,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        let (global_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            registry,
            instances,
            plugins,
            global_tx,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// 전역 스트림 구독 — `server_status_update`
    pub fn subscribe_global(&self) -> broadcast::Receiver<WsEvent> {
        self.global_tx.subscribe()
    }

    /// 서버별 룸 구독 — `status_update` + `console_log_batch`
    pub fn subscribe_room(&self, server_id: i64) -> broadcast::Receiver<WsEvent> {
        let mut rooms = self.rooms.lock().unwrap();
        rooms
            .entry(server_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn room_tx(&self, server_id: i64) -> Option<broadcast::Sender<WsEvent>> {
        self.rooms.lock().unwrap().get(&server_id).cloned()
    }

    /// 현재 상태를 포함한 서버 상세 페이로드 재계산
    pub fn server_detail(&self, server_id: i64) -> Option<Value> {
        let instance = self.instances.get(server_id)?;
        let snap = self.registry.snapshot(server_id);
        let status = status::resolve(
            &instance.working_dir,
            snap.live,
            snap.external,
            snap.last_exit_code,
        );
        let uptime_seconds = snap
            .spawned_at
            .map(|t| crate::utils::current_timestamp().saturating_sub(t));
        let phase = self
            .registry
            .get(server_id)
            .and_then(|s| s.handle())
            .map(|h| h.phase());
        Some(json!({
            "id": instance.id,
            "name": instance.name,
            "status": status,
            "phase": phase,
            "pid": snap.pid,
            "inner_pid": snap.inner_pid,
            "exit_code": snap.last_exit_code,
            "uptime_seconds": uptime_seconds,
            "groups": instance.groups,
        }))
    }

    /// 화이트리스트 이벤트를 그룹이 겹치는 플러그인 커넥션에 원문 그대로
    /// 전달합니다. 출처 커넥션 자신은 건너뛰고, 전송이 실패한 커넥션은
    /// 활성 목록에서 제거합니다.
    pub fn relay_to_plugins(
        &self,
        event_name: &str,
        source_server_id: i64,
        origin_peer: Option<u64>,
        raw_payload: &str,
    ) {
        if !RELAY_EVENTS.contains(&event_name) {
            return;
        }
        let source_groups = self.instances.groups_of(source_server_id);
        if source_groups.is_empty() {
            return;
        }

        let mut dead = Vec::new();
        for peer in self.plugins.peers() {
            if Some(peer.id) == origin_peer {
                continue;
            }
            let Some(name) = peer.server_name() else { continue };
            let Some(target) = self.instances.find_by_reported_name(&name) else {
                continue;
            };
            let shares_group = target.groups.iter().any(|g| source_groups.contains(g));
            if !shares_group {
                continue;
            }
            if !peer.send(raw_payload) {
                dead.push(peer.id);
            }
        }
        for id in dead {
            tracing::warn!("Removing dead plugin connection {}", id);
            self.plugins.remove(id);
        }
    }
}

impl EventSink for Broadcaster {
    fn notify_status_change(&self, server_id: i64) {
        let Some(detail) = self.server_detail(server_id) else {
            tracing::warn!("Status change for unknown server {}", server_id);
            return;
        };
        // 구독자가 없으면 send는 실패하지만 무해하다
        let _ = self
            .global_tx
            .send(WsEvent::new("server_status_update", detail.clone()));
        if let Some(tx) = self.room_tx(server_id) {
            let _ = tx.send(WsEvent::new("status_update", detail));
        }
    }

    fn emit_log_batch(&self, server_id: i64, lines: Vec<String>) {
        if let Some(tx) = self.room_tx(server_id) {
            let _ = tx.send(WsEvent::new("console_log_batch", json!({ "logs": lines })));
        }
    }
}
