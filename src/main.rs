use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use taskflow_sync::cep::{SYSTEM_LOGGER, SystemLogger};
use taskflow_sync::config::NodeConfig;
use taskflow_sync::http::HubClient;
use taskflow_sync::modules::ModuleRegistry;
use taskflow_sync::router::HubRouter;
use taskflow_sync::runtime::{NodeRuntime, open_store};
use taskflow_sync::task::NodeRole;
use taskflow_sync::ws::{self, NodeClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    eprintln!("taskflow-node v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Node: {} ({})", config.node_id, config.role);
    eprintln!("   Environment: {}", config.environment);

    // ── Store ───────────────────────────────────────────────────────────
    let store = open_store(&config).await?;
    match &config.db_path {
        Some(path) => eprintln!("   Database: {}", path.display()),
        None => eprintln!("   Database: in-memory"),
    }

    let modules = ModuleRegistry::builder()
        .cep(SYSTEM_LOGGER, SystemLogger)
        .build();
    let rt = Arc::new(NodeRuntime::new(config.clone(), store, modules));

    // ── Hub ─────────────────────────────────────────────────────────────
    if config.role == NodeRole::Hub {
        let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
        eprintln!("   Hub WS: ws://{}/hub/ws", config.bind_addr);
        ws::serve(listener, Arc::new(HubRouter::new(rt))).await?;
        return Ok(());
    }

    // ── Processor / coprocessor / consumer ──────────────────────────────
    eprintln!("   Hub: {}", config.hub_ws_url);
    match HubClient::new(config.hub_http_url.as_str())
        .register(&config.node_info())
        .await
    {
        Ok(hub_id) => tracing::info!(hub_id = %hub_id, "Announced to hub"),
        Err(e) => tracing::warn!(error = %e, "HTTP registration failed, continuing over WebSocket"),
    }

    NodeClient::new(rt).run().await?;
    tracing::info!("Reload requested, exiting");
    std::process::exit(0);
}

/// Console logging, plus a daily rolling file when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(config: &NodeConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(dir) = &config.log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .init();
        return None;
    };

    let appender = tracing_appender::rolling::daily(dir, "taskflow-node.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Some(guard)
}
