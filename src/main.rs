use anyhow::Context;
use clap::Parser;
use livecast_lib::{logger, server, RelayConfig, RelayContext};
use std::path::PathBuf;
use std::sync::Arc;

/// 流式生成中继
#[derive(Debug, Parser)]
#[command(name = "livecast", version, about)]
struct Cli {
    /// YAML 配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖监听地址
    #[arg(long)]
    host: Option<String>,

    /// 覆盖监听端口
    #[arg(short, long)]
    port: Option<u16>,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("[MAIN] 监听退出信号失败: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("[MAIN] 收到退出信号，开始关闭");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RelayConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    logger::init(&config.logging);

    let state = Arc::new(RelayContext::build(config).context("初始化中继失败")?);

    if state.bridge.is_enabled() {
        if let Err(e) = state.bridge.start().await {
            tracing::warn!("[MAIN] 辅助进程启动失败，将跳过桥接策略: {}", e);
        }
    }
    let monitor_task = state.monitor.spawn();

    let served = server::serve(state.clone(), shutdown_signal()).await;

    state.bridge.stop().await;
    state.monitor.shutdown();
    let _ = monitor_task.await;
    tracing::info!("[MAIN] 已退出");

    served.context("服务运行失败")
}
