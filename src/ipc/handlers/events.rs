//! WebSocket upgrade handlers for the live event plane.
//!
//! `GET /api/server/:id/console/ws` — 해당 서버 룸 구독. `status_update`와
//! `console_log_batch` 이벤트를 JSON 텍스트 프레임으로 수신합니다.
//!
//! `GET /api/events/ws` — 전역 구독. 모든 서버의 `server_status_update`를
//! 수신합니다.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use super::super::IPCServer;
use crate::events::WsEvent;

/// GET /api/server/:id/console/ws — 서버 룸 WebSocket
pub async fn console_ws(
    Path(id): Path<i64>,
    ws: WebSocketUpgrade,
    State(state): State<IPCServer>,
) -> impl IntoResponse {
    let rx = state.broadcaster.subscribe_room(id);
    ws.on_upgrade(move |socket| pump_events(socket, rx))
}

/// GET /api/events/ws — 전역 WebSocket
pub async fn global_ws(ws: WebSocketUpgrade, State(state): State<IPCServer>) -> impl IntoResponse {
    let rx = state.broadcaster.subscribe_global();
    ws.on_upgrade(move |socket| pump_events(socket, rx))
}

/// 브로드캐스트 수신분을 소켓으로 밀어넣는 루프. 클라이언트가 끊거나
/// 전송이 실패하면 끝납니다 — 한 구독자의 실패는 채널의 다른 구독자에
/// 영향을 주지 않습니다.
async fn pump_events(socket: WebSocket, mut rx: broadcast::Receiver<WsEvent>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if sender.send(Message::Text(event.to_message())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("WebSocket subscriber lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // 클라이언트 → 서버 방향 메시지는 이 plane에 없다
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
