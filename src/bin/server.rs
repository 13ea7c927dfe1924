//! OnCall HTTP 服务：POST /api/chat、POST /api/chat/stream（SSE）等
//!
//! 端口优先读 ONCALL_PORT，其次 [server] 段。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use oncall::agent::build_agent;
use oncall::api::{router, AppState};
use oncall::config::load_config;
use oncall::core::ShutdownManager;
use oncall::observability;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    observability::init(&cfg.log);

    let agent = Arc::new(build_agent(&cfg).await.context("Failed to create agent")?);

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();
    let cleanup = agent
        .sessions()
        .start_cleanup(cfg.session.cleanup_interval(), shutdown.token());

    let app = router(Arc::new(AppState::new(agent)));

    let port = std::env::var("ONCALL_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(cfg.server.port);
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.server.host, port))?;
    tracing::info!("OnCall server: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait_for_shutdown().await })
        .await?;

    tracing::info!(reason = ?shutdown.reason(), "server stopped");
    cleanup.await.ok();
    Ok(())
}
