//! Entry point for the `ferry-gateway` HTTP server.

use std::sync::Arc;

use ferry_engine::{EngineConfig, HttpRemoteConnector, QmpPool, TaskPool};
use ferry_gateway::routes::create_router;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::var("FERRY_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:9390".to_owned());
    let config = EngineConfig::from_env();

    let qmp = Arc::new(QmpPool::new(&config));
    attach_running_vms(&qmp, &config).await;

    let connector = Arc::new(HttpRemoteConnector::from_config(&config));
    let pool = Arc::new(TaskPool::new(config, qmp, connector));
    let app = create_router(pool);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "ferry-gateway listening");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

/// Connects a monitor for every `<vm>.qmp` socket already present.
async fn attach_running_vms(qmp: &QmpPool, config: &EngineConfig) {
    let entries = match std::fs::read_dir(&config.qmp_socket_dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(dir = %config.qmp_socket_dir.display(), error = %e, "cannot scan monitor sockets");
            return;
        }
    };

    for path in entries.filter_map(Result::ok).map(|e| e.path()) {
        if path.extension().is_none_or(|ext| ext != "qmp") {
            continue;
        }
        let Some(vm) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Err(e) = qmp.new_monitor(vm).await {
            tracing::warn!(vm, error = %e, "failed to attach monitor");
        }
    }
}
