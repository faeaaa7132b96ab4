//! 统一中继事件
//!
//! 上游解析器输出 `LiveEvent`，客户端帧生成器消费 `LiveEvent`。
//! 直连、子进程桥接、SDK 回退三条路径都落到同一种事件。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 中继事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiveEvent {
    /// 原样转发的上游消息
    Forward(Value),

    /// 文本增量（桥接 / SDK 路径）
    TextDelta { text: String },

    /// 轮次结束，携带聚合后的完整文本
    TurnComplete { text: String },
}

impl LiveEvent {
    pub fn is_turn_complete(&self) -> bool {
        matches!(self, LiveEvent::TurnComplete { .. })
    }
}
