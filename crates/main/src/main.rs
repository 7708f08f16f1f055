//! 主应用程序入口
//!
//! 加载配置，装配会话存储与实时中继，启动 Axum 服务。

use std::sync::Arc;

use anyhow::Context;
use application::{ChatRepository, InMemoryChatRepository};
use config::{AppConfig, StorageBackend};
use infrastructure::{Infrastructure, InfrastructureConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    tracing::info!(config = %config.sanitized(), "配置已加载");

    let chat_repository: Arc<dyn ChatRepository> = match config.database.backend {
        StorageBackend::Postgres => {
            let infrastructure = Infrastructure::connect(InfrastructureConfig::from(&config.database))
                .await
                .context("连接数据库失败")?;
            let repository: Arc<dyn ChatRepository> = infrastructure.chat_repository;
            repository
        }
        StorageBackend::Memory => {
            tracing::warn!("使用进程内会话存储，重启后数据丢失");
            Arc::new(InMemoryChatRepository::new())
        }
    };

    let shutdown = CancellationToken::new();
    let state = AppState::new(chat_repository, &config, shutdown.clone());
    let app = router(state);

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("无法监听 {address}"))?;

    tracing::info!("会话中继服务启动在 http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("服务已停止");
    Ok(())
}

/// 收到 Ctrl-C 或 SIGTERM 后取消根信号，所有连接随之关闭
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "无法监听 Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "无法监听 SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("收到关停信号，正在关闭连接");
    shutdown.cancel();
}
