//! IPC HTTP 서버 — React 패널과 라우터가 소비하는 REST + WebSocket 표면.

pub mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::events::Broadcaster;
use crate::supervisor::Supervisor;

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub broadcaster: Arc<Broadcaster>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(
        supervisor: Arc<Supervisor>,
        broadcaster: Arc<Broadcaster>,
        listen_addr: &str,
    ) -> Self {
        Self {
            supervisor,
            broadcaster,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub async fn start(self) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);

        let router = Router::new()
            .route("/api/servers", get(handlers::server::list_servers))
            .route("/api/server/:id/status", get(handlers::server::get_server_status))
            .route("/api/server/:id/start", post(handlers::server::start_server))
            .route("/api/server/:id/stop", post(handlers::server::stop_server))
            .route("/api/server/:id/restart", post(handlers::server::restart_server))
            .route("/api/server/:id/kill", post(handlers::server::kill_server))
            .route("/api/server/:id/command", post(handlers::server::send_command))
            .route("/api/server/:id/logs", get(handlers::server::get_logs))
            .route("/api/server/:id/console/ws", get(handlers::events::console_ws))
            .route("/api/events/ws", get(handlers::events::global_ws))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router).await?;
        Ok(())
    }
}
