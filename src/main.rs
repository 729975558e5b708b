use std::sync::Arc;

use mc_warden::artifact::FileCatalog;
use mc_warden::config::{SelectionStore, WardenConfig};
use mc_warden::ipc;
use mc_warden::supervisor::Supervisor;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mc_warden=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    tracing::info!("Warden daemon starting");

    let cfg = WardenConfig::load()?;
    let catalog = Arc::new(FileCatalog::new(&cfg.catalog_path));
    let listen_addr = cfg.listen_addr.clone();
    let autostart = cfg.autostart;
    let launch_args = cfg.launch_args.clone();
    let selection = SelectionStore::load(&cfg.selection_path)?;

    let supervisor = Supervisor::new(cfg, catalog);

    if autostart {
        tracing::info!("Autostart enabled; starting server");
        if let Err(e) = supervisor.autostart(&selection, &launch_args).await {
            tracing::error!("Autostart failed: {}", e);
        }
    }

    let ipc_server = ipc::IPCServer::new(supervisor.clone(), &listen_addr);

    // Graceful shutdown: Ctrl+C 시 서버 프로세스 정리
    tokio::select! {
        result = ipc_server.start() => {
            if let Err(e) = result {
                tracing::error!("IPC server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    supervisor.shutdown().await;
    tracing::info!("Warden daemon shutting down");
    Ok(())
}
