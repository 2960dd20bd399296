//! Genie 服务入口
//!
//! 加载配置与日志，组装 Agent 组件，启动 HTTP 任务接口；Ctrl+C / SIGTERM 时优雅关闭。

use std::sync::Arc;

use anyhow::Context;
use genie::{
    agent::create_agent_components,
    config::load_config,
    core::ShutdownManager,
    integrations::{router, ApiState},
    observability,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 可选的配置文件路径：第一个命令行参数
    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let components = create_agent_components(&cfg, shutdown.token())
        .await
        .context("Failed to create agent components")?;
    let app = router(ApiState {
        agent: Arc::new(components),
        upload_dir: cfg.server.upload_dir.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind))?;
    tracing::info!(bind = %cfg.server.bind, app = ?cfg.app.name, "Genie server listening");

    let mut reasons = shutdown.subscribe();
    let signal = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait_for_shutdown().await })
        .await
        .context("Server error")?;

    if let Ok(reason) = reasons.try_recv() {
        tracing::info!(reason = ?reason, "Shutdown requested");
    }

    tracing::info!("Server stopped");
    Ok(())
}
