//! 客户端网关
//!
//! - 握手前准入（Origin、每 IP 连接数、token）
//! - 每条消息的大小与速率限制
//! - setup / clientContent 处理与生成任务调度

mod guard;
mod handler;
mod processor;

pub use guard::{constant_time_eq, extract_token, ConnectionGuard, ConnectionPermit};
pub use handler::live_socket_handler;
pub use processor::{InboundAction, MessageProcessor, CLOSE_MESSAGE_TOO_BIG, CLOSE_POLICY_VIOLATION};
