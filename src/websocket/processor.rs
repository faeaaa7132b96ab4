//! WebSocket 消息处理器
//!
//! 每个连接一个实例：先做速率窗口与大小检查，再把 JSON 帧解析为
//! setup / clientContent 动作。不做任何 IO，便于单独测试。

use crate::models::{normalize_model_name, ClientEnvelope, GenerationRequest};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// 超限时的关闭码
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// 处理一条入站消息的结果
#[derive(Debug)]
pub enum InboundAction {
    /// 以指定关闭码结束连接
    Close { code: u16, reason: &'static str },
    /// 立即回复 setupComplete
    Setup { model: String },
    /// 发起一轮生成
    Generate(GenerationRequest),
    /// 非法帧，回复错误信封但保持连接
    Invalid(String),
    /// 无需处理
    Ignore,
}

/// 消息处理器
pub struct MessageProcessor {
    max_payload_bytes: usize,
    max_messages: u32,
    window: Duration,
    window_start: Instant,
    window_count: u32,
    model: Option<String>,
    generation_config: Option<Value>,
    default_model: String,
}

impl MessageProcessor {
    pub fn new(
        max_payload_bytes: usize,
        max_messages: u32,
        window: Duration,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            max_payload_bytes,
            max_messages,
            window,
            window_start: Instant::now(),
            window_count: 0,
            model: None,
            generation_config: None,
            default_model: default_model.into(),
        }
    }

    /// setup 中捕获的模型；未收到 setup 时为 None
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// 计入速率窗口，返回是否超限
    fn rate_exceeded(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) > self.window {
            self.window_start = now;
            self.window_count = 0;
        }
        self.window_count += 1;
        self.window_count > self.max_messages
    }

    pub fn process(&mut self, raw: &str) -> InboundAction {
        self.process_at(raw, Instant::now())
    }

    pub fn process_at(&mut self, raw: &str, now: Instant) -> InboundAction {
        if self.rate_exceeded(now) {
            return InboundAction::Close {
                code: CLOSE_POLICY_VIOLATION,
                reason: "Rate limit exceeded",
            };
        }
        if raw.len() > self.max_payload_bytes {
            return InboundAction::Close {
                code: CLOSE_MESSAGE_TOO_BIG,
                reason: "Message too large",
            };
        }

        let envelope: ClientEnvelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => return InboundAction::Invalid(format!("malformed client message: {}", e)),
        };

        if let Some(setup) = envelope.setup {
            if let Some(model) = setup.model.as_deref().map(normalize_model_name) {
                if !model.is_empty() {
                    self.model = Some(model);
                }
            }
            self.generation_config = setup.generation_config;
            let model = self.current_model();
            tracing::info!("[GATEWAY] 收到 setup，模型 {}", model);
            return InboundAction::Setup { model };
        }

        if let Some(content) = envelope.client_content {
            let parts = content.text_segments();
            if parts.is_empty() {
                tracing::debug!("[GATEWAY] clientContent 不含文本，忽略");
                return InboundAction::Ignore;
            }
            let request = GenerationRequest::new(self.current_model(), parts)
                .with_generation_config(self.generation_config.clone());
            return InboundAction::Generate(request);
        }

        InboundAction::Ignore
    }

    fn current_model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }
}
