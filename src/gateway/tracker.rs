//! External state tracker — 동반 플러그인이 보고하는 수명주기 진실을
//! 로컬 프로세스 관찰과 합칩니다.
//!
//! stdout 파싱보다 신뢰할 수 있는 "완전히 준비됨" 신호가 여기로 들어오며,
//! 폴링 없이 순수하게 이벤트 구동으로 동작합니다. 오버라이드의 해제는
//! supervisor의 exit-watcher만 수행합니다 — 로컬 종료 후 도착한 낡은
//! 보고가 죽은 서버의 상태를 되살리는 경쟁을 막기 위함입니다.

use serde_json::Value;
use std::sync::Arc;

use crate::events::EventSink;
use crate::instance::InstanceStore;
use crate::supervisor::registry::ProcessRegistry;
use crate::supervisor::status::ExternalStatus;

pub struct ExternalStateTracker {
    registry: Arc<ProcessRegistry>,
    instances: Arc<InstanceStore>,
    sink: Arc<dyn EventSink>,
}

impl ExternalStateTracker {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        instances: Arc<InstanceStore>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            instances,
            sink,
        }
    }

    /// 게이트웨이가 수신한 이벤트 한 건을 반영합니다.
    /// 수명주기 이벤트가 아니면 무시하고, 서버를 특정할 수 없으면 경고 후
    /// 버립니다 — 어느 쪽도 핸들러를 죽이지 않습니다.
    pub fn handle_event(&self, reported_server: Option<&str>, event: &str, data: &Value) {
        let lifecycle = matches!(
            event,
            super::EVENT_START_PENDING | super::EVENT_STARTUP | super::EVENT_STOP
        );
        if !lifecycle {
            tracing::debug!("Ignoring non-lifecycle plugin event '{}'", event);
            return;
        }

        let Some(name) = reported_server else {
            tracing::warn!("Lifecycle event '{}' from unbound connection, dropping", event);
            return;
        };
        let Some(instance) = self.instances.find_by_reported_name(name) else {
            tracing::warn!("Lifecycle event for unknown server '{}', dropping", name);
            return;
        };

        match event {
            super::EVENT_START_PENDING => {
                self.set_external_status(instance.id, ExternalStatus::Pending, None);
            }
            super::EVENT_STARTUP => {
                self.set_external_status(instance.id, ExternalStatus::Running, None);
            }
            super::EVENT_STOP => {
                let code = data
                    .get("return_code")
                    .and_then(|c| c.as_i64())
                    .map(|c| c as i32);
                self.record_stop(instance.id, code);
            }
            _ => unreachable!(),
        }
    }

    /// 외부 오버라이드 설정. 종료 코드가 함께 오면 LastExitCode도 갱신.
    pub fn set_external_status(
        &self,
        server_id: i64,
        status: ExternalStatus,
        return_code: Option<i32>,
    ) {
        let slot = self.registry.slot(server_id);
        if let Some(code) = return_code {
            slot.record_reported_exit(code);
        }
        if slot.set_external(status) {
            tracing::info!("Server {} external status -> {:?}", server_id, status);
            self.sink.notify_status_change(server_id);
        } else {
            // exit-watcher가 이미 이 수명주기를 닫았다 — exit wins
            tracing::debug!(
                "Late external report for server {} dropped (exit already observed)",
                server_id
            );
        }
    }

    /// 플러그인이 보고한 정지 — 종료 코드만 기록합니다. 오버라이드는
    /// 로컬 종료가 관찰될 때 exit-watcher가 지웁니다.
    fn record_stop(&self, server_id: i64, return_code: Option<i32>) {
        let slot = self.registry.slot(server_id);
        if let Some(code) = return_code {
            tracing::info!("Server {} reported stop with code {}", server_id, code);
            slot.record_reported_exit(code);
        } else {
            tracing::info!("Server {} reported stop", server_id);
        }
        self.sink.notify_status_change(server_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ServerInstance;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        changes: Mutex<Vec<i64>>,
    }

    impl EventSink for RecordingSink {
        fn notify_status_change(&self, server_id: i64) {
            self.changes.lock().unwrap().push(server_id);
        }
        fn emit_log_batch(&self, _server_id: i64, _lines: Vec<String>) {}
    }

    fn tracker() -> (ExternalStateTracker, Arc<ProcessRegistry>, Arc<RecordingSink>) {
        let registry = Arc::new(ProcessRegistry::new());
        let instances = Arc::new(InstanceStore::new("/nonexistent/instances.json"));
        let _ = instances.add(ServerInstance::new(1, "survival", Path::new("/srv/survival")));
        let _ = instances.add(ServerInstance::new(2, "메인 서버", Path::new("/srv/main")));
        let sink = Arc::new(RecordingSink::default());
        let tracker = ExternalStateTracker::new(registry.clone(), instances, sink.clone());
        (tracker, registry, sink)
    }

    #[test]
    fn test_startup_sets_running_override() {
        let (tracker, registry, sink) = tracker();
        tracker.handle_event(Some("survival"), super::super::EVENT_STARTUP, &Value::Null);

        let snap = registry.snapshot(1);
        assert_eq!(snap.external, Some(ExternalStatus::Running));
        assert_eq!(*sink.changes.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_stop_records_code_but_keeps_override() {
        let (tracker, registry, _sink) = tracker();
        tracker.handle_event(Some("survival"), super::super::EVENT_STARTUP, &Value::Null);
        tracker.handle_event(
            Some("survival"),
            super::super::EVENT_STOP,
            &json!({ "return_code": 2 }),
        );

        let snap = registry.snapshot(1);
        assert_eq!(snap.last_exit_code, Some(2));
        // 오버라이드 해제는 exit-watcher의 몫
        assert_eq!(snap.external, Some(ExternalStatus::Running));
    }

    #[test]
    fn test_unknown_server_dropped() {
        let (tracker, registry, sink) = tracker();
        tracker.handle_event(Some("no-such"), super::super::EVENT_STARTUP, &Value::Null);

        assert!(registry.get(1).map(|s| s.snapshot().external).unwrap_or(None).is_none());
        assert!(sink.changes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unbound_connection_dropped() {
        let (tracker, _registry, sink) = tracker();
        tracker.handle_event(None, super::super::EVENT_STARTUP, &Value::Null);
        assert!(sink.changes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_non_lifecycle_ignored() {
        let (tracker, registry, sink) = tracker();
        tracker.handle_event(Some("survival"), "mcdr.player_joined", &json!({"player": "p"}));
        assert!(registry.snapshot(1).external.is_none());
        assert!(sink.changes.lock().unwrap().is_empty());
    }

    /// 표시 이름이 달라도 작업 디렉토리 이름으로 매칭된다
    #[test]
    fn test_directory_name_correlation() {
        let (tracker, registry, _sink) = tracker();
        tracker.handle_event(Some("main"), super::super::EVENT_START_PENDING, &Value::Null);
        assert_eq!(registry.snapshot(2).external, Some(ExternalStatus::Pending));
    }

    /// 종료 래치 이후의 늦은 보고는 상태를 되살리지 못한다
    #[test]
    fn test_late_report_after_exit_latched() {
        let (tracker, registry, sink) = tracker();
        let slot = registry.slot(1);
        slot.finish_lifecycle(Some(0)); // exit-watcher 정리 시뮬레이션

        tracker.handle_event(Some("survival"), super::super::EVENT_STARTUP, &Value::Null);

        assert!(registry.snapshot(1).external.is_none());
        assert!(sink.changes.lock().unwrap().is_empty());
    }
}
