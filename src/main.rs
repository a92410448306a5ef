//! Reflex - 自我改进的通知决策核心
//!
//! 入口：初始化日志、装配运行时、等待停机信号并排空待决事件。

use std::sync::Arc;

use anyhow::Context;
use reflex::config::load_config;
use reflex::core::ShutdownManager;
use reflex::llm::embedding::create_embedder_from_config;
use reflex::llm::create_reasoner_from_config;
use reflex::storage::MemoryStore;
use reflex::ReflexRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    reflex::observability::init();

    let config = load_config(None).context("Failed to load config")?;

    let reasoner = create_reasoner_from_config(&config.reasoner);
    let embedder = create_embedder_from_config(&config.embedding);
    if reasoner.is_none() {
        tracing::warn!("No reasoner configured, falling back to heuristic-only decisions");
    }

    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(ReflexRuntime::new(config, store, reasoner, embedder));
    runtime.start().await;
    tracing::info!("Reflex runtime started");

    // 停机：Ctrl+C / SIGTERM 触发，先排空队列再关闭各子系统
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let mut reason_rx = shutdown.subscribe();
    shutdown.wait_for_shutdown().await;
    if let Ok(reason) = reason_rx.try_recv() {
        tracing::info!(?reason, "Shutdown signal received");
    }

    let flushed = runtime.flush_pending("shutdown").await;
    if flushed > 0 {
        tracing::info!(flushed, "Flushed pending decisions before exit");
    }
    runtime.shutdown().await;

    Ok(())
}
