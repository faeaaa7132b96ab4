//! 数据模型
//!
//! 客户端协议帧与子进程桥接记录

pub mod bridge_model;
pub mod live_model;

pub use bridge_model::{parse_bridge_line, BridgeEvent, BridgeRecord, BridgeRequest};
pub use live_model::{
    error_message, normalize_model_name, ClientContent, ClientEnvelope, ClientFrame,
    GenerationRequest, SetupPayload,
};
