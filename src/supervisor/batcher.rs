//! Log batcher — 고빈도 로그 생산을 이벤트 방출 오버헤드에서 분리합니다.
//!
//! reader loop가 줄을 버퍼에 쌓고, 서버별 타이머 태스크가 고정 간격마다
//! 버퍼를 원자적으로 비워 한 번의 배치 이벤트로 방출합니다. 방출 빈도는
//! 로그량과 무관하게 유계이고, 종료 시 마지막 무조건 드레인으로 꼬리
//! 줄이 유실되지 않습니다.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::EventSink;

/// 배치 창 사이에 쌓이는 줄의 상한. 넘치면 가장 오래된 줄부터 버립니다 —
/// 내구 기록은 LogFile이 담당하므로 여기서의 손실은 허용됩니다.
pub const DEFAULT_BUFFER_CAP: usize = 4096;

/// 배치 창 동안 정리된 콘솔 줄을 모으는 유계 버퍼.
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    max_size: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAP)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            max_size,
        }
    }

    /// 줄 추가. 삽입 순서가 곧 방출 순서입니다.
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= self.max_size {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// 버퍼를 원자적으로 비우고 내용물을 반환합니다.
    pub fn drain(&self) -> Vec<String> {
        let mut lines = self.lines.lock().unwrap();
        std::mem::take(&mut *lines).into()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// 서버별 배치 방출 태스크를 기동합니다.
///
/// 매 틱마다 버퍼를 비우고, 비어 있지 않을 때만 배치를 방출합니다.
/// 토큰이 취소되면(오직 exit-watcher가 취소합니다) 남은 줄을 무조건
/// 드레인해 마지막 배치를 방출한 뒤 종료합니다.
pub fn spawn_batch_task(
    server_id: i64,
    buffer: Arc<LogBuffer>,
    sink: Arc<dyn EventSink>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    // 종료 전 마지막 드레인 — 빈 배치라도 방출
                    sink.emit_log_batch(server_id, buffer.drain());
                    break;
                }
                _ = ticker.tick() => {
                    let lines = buffer.drain();
                    if !lines.is_empty() {
                        sink.emit_log_batch(server_id, lines);
                    }
                }
            }
        }
        tracing::debug!("Batch emitter for server {} stopped", server_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// 방출된 배치를 기록하는 테스트 싱크
    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<(i64, Vec<String>)>>,
        status_changes: StdMutex<Vec<i64>>,
    }

    impl EventSink for RecordingSink {
        fn notify_status_change(&self, server_id: i64) {
            self.status_changes.lock().unwrap().push(server_id);
        }

        fn emit_log_batch(&self, server_id: i64, lines: Vec<String>) {
            self.batches.lock().unwrap().push((server_id, lines));
        }
    }

    #[test]
    fn test_buffer_order_and_drain() {
        let buffer = LogBuffer::new();
        buffer.push("a".into());
        buffer.push("b".into());
        buffer.push("c".into());

        assert_eq!(buffer.drain(), vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_buffer_bounded() {
        let buffer = LogBuffer::with_capacity(3);
        for i in 0..5 {
            buffer.push(format!("line {}", i));
        }
        // 가장 오래된 줄부터 버려진다
        assert_eq!(buffer.drain(), vec!["line 2", "line 3", "line 4"]);
    }

    /// 한 창 안의 M줄 버스트 → 순서 보존된 단일 배치
    #[tokio::test]
    async fn test_burst_becomes_single_batch() {
        let buffer = Arc::new(LogBuffer::new());
        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();

        // 첫 틱(즉시) 이전에 쌓이지 않도록 먼저 기동
        let task = spawn_batch_task(
            7,
            buffer.clone(),
            sink.clone(),
            Duration::from_millis(40),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;

        for i in 0..100 {
            buffer.push(format!("line {}", i));
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        {
            let batches = sink.batches.lock().unwrap();
            assert_eq!(batches.len(), 1, "burst within one window must be one batch");
            let (id, lines) = &batches[0];
            assert_eq!(*id, 7);
            assert_eq!(lines.len(), 100);
            assert_eq!(lines[0], "line 0");
            assert_eq!(lines[99], "line 99");
        }

        token.cancel();
        task.await.unwrap();
    }

    /// 줄이 없는 창에서는 배치가 방출되지 않는다
    #[tokio::test]
    async fn test_empty_window_emits_nothing() {
        let buffer = Arc::new(LogBuffer::new());
        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();

        let task = spawn_batch_task(
            1,
            buffer.clone(),
            sink.clone(),
            Duration::from_millis(10),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(sink.batches.lock().unwrap().is_empty());

        token.cancel();
        task.await.unwrap();

        // 취소 시의 마지막 드레인은 빈 배치라도 방출된다
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].1.is_empty());
    }

    /// 취소 시 남은 줄이 마지막 배치로 방출된다
    #[tokio::test]
    async fn test_final_drain_on_cancel() {
        let buffer = Arc::new(LogBuffer::new());
        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();

        let task = spawn_batch_task(
            2,
            buffer.clone(),
            sink.clone(),
            Duration::from_secs(3600), // 틱이 오기 전에 취소
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;

        buffer.push("trailing 1".into());
        buffer.push("trailing 2".into());
        token.cancel();
        task.await.unwrap();

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1, vec!["trailing 1", "trailing 2"]);
    }
}
