//! Plugin gateway — 게임 서버 안에서 도는 동반 플러그인이 여는 영속
//! TCP 커넥션을 받아들입니다.
//!
//! 와이어 포맷은 줄 단위 JSON입니다. 메시지는 단일 객체
//! `{"event": "mcdr.<name>", "data": {...}, "server": "<name>"}` 이거나
//! 배치 봉투 `{"batch": true, "items": [...]}` 입니다. 커넥션은 `server`
//! 필드를 가진 첫 메시지에서 서버 이름에 늦게 바인딩됩니다.

pub mod tracker;

use anyhow::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::events::Broadcaster;
use crate::instance::InstanceStore;
use self::tracker::ExternalStateTracker;

// 인식하는 수명주기/중계 이벤트 이름
pub const EVENT_START_PENDING: &str = "mcdr.server_start_pending";
pub const EVENT_STARTUP: &str = "mcdr.server_startup";
pub const EVENT_STOP: &str = "mcdr.server_stop";
pub const EVENT_PLAYER_JOINED: &str = "mcdr.player_joined";
pub const EVENT_PLAYER_LEFT: &str = "mcdr.player_left";
pub const EVENT_USER_INFO: &str = "mcdr.user_info";

/// 연결된 플러그인 소켓 하나.
///
/// 수신(수명주기/이벤트 보고)과 송신(그룹 중계로 전달되는 이벤트) 양쪽에
/// 쓰입니다.
pub struct PluginPeer {
    pub id: u64,
    server_name: Mutex<Option<String>>,
    tx: mpsc::UnboundedSender<String>,
}

impl PluginPeer {
    /// `server` 필드를 처음 본 시점에 바인딩. 이후 선언은 무시합니다.
    pub fn bind_server(&self, name: &str) {
        let mut bound = self.server_name.lock().unwrap();
        if bound.is_none() {
            tracing::info!("Plugin connection {} bound to server '{}'", self.id, name);
            *bound = Some(name.to_string());
        }
    }

    pub fn server_name(&self) -> Option<String> {
        self.server_name.lock().unwrap().clone()
    }

    /// 중계 라인 전송. 커넥션이 죽어 있으면 false.
    pub fn send(&self, line: &str) -> bool {
        self.tx.send(line.to_string()).is_ok()
    }
}

/// 활성 플러그인 커넥션 집합
pub struct PluginRegistry {
    peers: Mutex<Vec<Arc<PluginPeer>>>,
    next_id: AtomicU64,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, tx: mpsc::UnboundedSender<String>) -> Arc<PluginPeer> {
        let peer = Arc::new(PluginPeer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            server_name: Mutex::new(None),
            tx,
        });
        self.peers.lock().unwrap().push(peer.clone());
        peer
    }

    pub fn remove(&self, id: u64) {
        self.peers.lock().unwrap().retain(|p| p.id != id);
    }

    pub fn peers(&self) -> Vec<Arc<PluginPeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn register_for_test(&self) -> (Arc<PluginPeer>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.register(tx), rx)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 게이트웨이 리스너
pub struct PluginGateway {
    listen_addr: String,
    plugins: Arc<PluginRegistry>,
    tracker: Arc<ExternalStateTracker>,
    broadcaster: Arc<Broadcaster>,
    instances: Arc<InstanceStore>,
}

impl PluginGateway {
    pub fn new(
        listen_addr: &str,
        plugins: Arc<PluginRegistry>,
        tracker: Arc<ExternalStateTracker>,
        broadcaster: Arc<Broadcaster>,
        instances: Arc<InstanceStore>,
    ) -> Self {
        Self {
            listen_addr: listen_addr.to_string(),
            plugins,
            tracker,
            broadcaster,
            instances,
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.run_on(listener).await
    }

    /// 이미 바인딩된 리스너로 게이트웨이를 돌립니다 (포트 0 바인딩 테스트용).
    pub async fn run_on(self, listener: TcpListener) -> Result<()> {
        tracing::info!("Plugin gateway listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            tracing::info!("Plugin connection accepted from {}", addr);
            let plugins = self.plugins.clone();
            let tracker = self.tracker.clone();
            let broadcaster = self.broadcaster.clone();
            let instances = self.instances.clone();
            tokio::spawn(async move {
                handle_connection(stream, plugins, tracker, broadcaster, instances).await;
            });
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    plugins: Arc<PluginRegistry>,
    tracker: Arc<ExternalStateTracker>,
    broadcaster: Arc<Broadcaster>,
    instances: Arc<InstanceStore>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let peer = plugins.register(tx);
    let peer_id = peer.id;

    // ── writer ───────────────────────────────────────────────
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    // ── reader ───────────────────────────────────────────────
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(msg) => {
                if msg.get("batch").and_then(|b| b.as_bool()) == Some(true) {
                    match msg.get("items").and_then(|i| i.as_array()) {
                        Some(items) => {
                            for item in items {
                                dispatch_message(&peer, item, &tracker, &broadcaster, &instances);
                            }
                        }
                        None => {
                            tracing::warn!("Batch envelope without items from connection {}", peer_id);
                        }
                    }
                } else {
                    dispatch_message(&peer, &msg, &tracker, &broadcaster, &instances);
                }
            }
            Err(e) => {
                // 소켓은 유지하고 메시지만 버린다
                tracing::warn!("Malformed plugin message on connection {}: {}", peer_id, e);
            }
        }
    }

    plugins.remove(peer_id);
    writer.abort();
    tracing::info!("Plugin connection {} closed", peer_id);
}

/// 단일 메시지 처리: 지연 바인딩 → tracker 반영 → 그룹 중계
fn dispatch_message(
    peer: &Arc<PluginPeer>,
    msg: &Value,
    tracker: &ExternalStateTracker,
    broadcaster: &Broadcaster,
    instances: &InstanceStore,
) {
    if let Some(server) = msg.get("server").and_then(|s| s.as_str()) {
        peer.bind_server(server);
    }

    let Some(event) = msg.get("event").and_then(|e| e.as_str()) else {
        tracing::warn!("Plugin message without event field, dropping");
        return;
    };
    let data = msg.get("data").cloned().unwrap_or(Value::Null);

    let bound = peer.server_name();
    tracker.handle_event(bound.as_deref(), event, &data);

    if let Some(source_name) = bound {
        if let Some(source) = instances.find_by_reported_name(&source_name) {
            broadcaster.relay_to_plugins(event, source.id, Some(peer.id), &msg.to_string());
        }
    }
}
