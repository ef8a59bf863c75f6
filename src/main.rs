mod config;
mod events;
mod gateway;
mod instance;
mod ipc;
mod logfile;
mod supervisor;
mod utils;

use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    tracing::info!("Yagura core daemon starting");

    let cfg = config::GlobalConfig::load()?;

    // 인스턴스 저장소 로드
    let instances = Arc::new(instance::InstanceStore::new(&cfg.instances_file));
    if let Err(e) = instances.load() {
        tracing::warn!("Failed to load instance store: {}", e);
    }

    // 컴포넌트 배선: registry → broadcaster → supervisor/tracker → gateway → IPC
    let registry = Arc::new(supervisor::registry::ProcessRegistry::new());
    let plugins = Arc::new(gateway::PluginRegistry::new());
    let broadcaster = Arc::new(events::Broadcaster::new(
        registry.clone(),
        instances.clone(),
        plugins.clone(),
    ));
    let sink: Arc<dyn events::EventSink> = broadcaster.clone();

    let supervisor = Arc::new(supervisor::Supervisor::new(
        registry.clone(),
        instances.clone(),
        sink.clone(),
        &cfg,
    ));
    let tracker = Arc::new(gateway::tracker::ExternalStateTracker::new(
        registry,
        instances.clone(),
        sink,
    ));

    // 플러그인 게이트웨이 기동
    let plugin_gateway = gateway::PluginGateway::new(
        &cfg.gateway_listen,
        plugins,
        tracker,
        broadcaster.clone(),
        instances,
    );
    tokio::spawn(async move {
        if let Err(e) = plugin_gateway.run().await {
            tracing::error!("Plugin gateway error: {}", e);
        }
    });

    // Graceful shutdown: Ctrl+C 시 라이브 서버 전부에 정지 요청
    let supervisor_shutdown = supervisor.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, requesting stop of running servers");
        supervisor_shutdown.stop_all().await;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        tracing::info!("Cleanup complete, exiting");
        std::process::exit(0);
    });

    let ipc_server = ipc::IPCServer::new(supervisor, broadcaster, &cfg.ipc_listen);
    if let Err(e) = ipc_server.start().await {
        tracing::error!("IPC server error: {}", e);
    }

    tracing::info!("Yagura core daemon shutting down");
    Ok(())
}
