//! HTTP / WebSocket 服务
//!
//! 一个 axum 路由同时承载客户端 Live 入口与诊断接口

pub mod handlers;

use crate::context::RelayContext;
use crate::websocket::live_socket_handler;
use axum::routing::{get, post};
use axum::Router;
use handlers::debug_api;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// 诊断接口请求体上限
const DEBUG_BODY_LIMIT: usize = 64 * 1024;

/// 路由共享状态
pub type AppState = Arc<RelayContext>;

/// 构建路由
pub fn build_router(state: AppState) -> Router {
    let ws_path = state.config.server.ws_path.clone();
    Router::new()
        .route(&ws_path, get(live_socket_handler))
        .route("/health", get(debug_api::health))
        .route("/api/debug/stats", get(debug_api::debug_stats))
        .route("/api/debug/errors", get(debug_api::debug_errors))
        .route("/api/debug/reset", post(debug_api::debug_reset))
        .route("/api/debug/recover", post(debug_api::debug_recover))
        .layer(RequestBodyLimitLayer::new(DEBUG_BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 绑定地址并运行，直到 `shutdown` 完成
pub async fn serve<F>(state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        "[SERVER] 监听 {}，Live 入口 {}",
        listener.local_addr()?,
        state.config.server.ws_path
    );

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
