//! livecast - 流式生成中继
//!
//! 客户端经 WebSocket 接入，中继按优先级尝试子进程桥接、直连 Live
//! （运行时协商模型名与内容格式）和 SDK 流式回退，
//! 把上游的各种响应形状统一成增量 + 单条聚合消息写回客户端。

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod logger;
pub mod models;
pub mod negotiator;
pub mod orchestrator;
pub mod providers;
pub mod resilience;
pub mod server;
pub mod telemetry;
pub mod translator;
pub mod websocket;

pub use config::RelayConfig;
pub use context::RelayContext;
pub use error::RelayError;
