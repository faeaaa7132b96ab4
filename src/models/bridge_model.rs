//! 子进程桥接协议
//!
//! 按行分隔的 JSON 记录。出站记录带 `"v":1` 版本号；
//! 入站记录兼容 `request_id` 与 `requestId` 两种字段名

use serde::{Deserialize, Serialize};

/// 当前协议版本
pub const BRIDGE_PROTOCOL_VERSION: u32 = 1;

/// 出站请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeRequest {
    pub v: u32,
    pub action: String,
    pub model: String,
    pub text: String,
    pub response_modalities: Vec<String>,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

impl BridgeRequest {
    pub fn process(
        request_id: impl Into<String>,
        model: impl Into<String>,
        text: impl Into<String>,
        response_modalities: Vec<String>,
    ) -> Self {
        Self {
            v: BRIDGE_PROTOCOL_VERSION,
            action: "process".to_string(),
            model: model.into(),
            text: text.into(),
            response_modalities,
            request_id: request_id.into(),
        }
    }

    /// 序列化为单行（含换行符）
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// 入站原始记录
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeRecord {
    #[serde(default)]
    pub v: Option<u32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default, rename = "requestId")]
    pub request_id_camel: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub data_length: Option<u64>,
    /// 辅助进程还会继续尝试下一个模型
    #[serde(default)]
    pub trying_next: Option<bool>,
}

/// 解析后的入站事件
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// `{status:"ready"|"initialized"}`
    Ready,
    /// 其他状态（shutdown / error ...）
    Status(String),
    Connecting { request_id: String, model: Option<String> },
    Connected { request_id: String, model: Option<String> },
    Processing { request_id: String },
    TextChunk { request_id: String, text: String },
    AudioChunk { request_id: String, bytes: u64 },
    Complete { request_id: String, text: Option<String> },
    Error {
        request_id: Option<String>,
        message: String,
        trying_next: bool,
    },
    TestResponse,
    Unknown(String),
}

impl BridgeRecord {
    pub fn request_id(&self) -> Option<String> {
        self.request_id
            .clone()
            .or_else(|| self.request_id_camel.clone())
    }

    /// 将记录归类为事件
    pub fn into_event(self) -> BridgeEvent {
        let request_id = self.request_id();

        if let Some(kind) = self.kind.as_deref() {
            let id = request_id.clone().unwrap_or_default();
            return match kind {
                "connecting" => BridgeEvent::Connecting {
                    request_id: id,
                    model: self.model,
                },
                "connected" => BridgeEvent::Connected {
                    request_id: id,
                    model: self.model,
                },
                "processing" => BridgeEvent::Processing { request_id: id },
                "text_chunk" => BridgeEvent::TextChunk {
                    request_id: id,
                    text: self.text.unwrap_or_default(),
                },
                "audio_chunk" => BridgeEvent::AudioChunk {
                    request_id: id,
                    bytes: self.data_length.unwrap_or(0),
                },
                "complete" => BridgeEvent::Complete {
                    request_id: id,
                    text: self.text,
                },
                "error" => BridgeEvent::Error {
                    request_id,
                    message: self
                        .message
                        .unwrap_or_else(|| "bridge reported an error".to_string()),
                    trying_next: self.trying_next.unwrap_or(false),
                },
                "test_response" => BridgeEvent::TestResponse,
                other => BridgeEvent::Unknown(other.to_string()),
            };
        }

        match self.status.as_deref() {
            Some("ready") | Some("initialized") => BridgeEvent::Ready,
            Some(status) => BridgeEvent::Status(status.to_string()),
            None => BridgeEvent::Unknown(String::new()),
        }
    }
}

/// 解析一行输出；非 JSON 行返回 None
pub fn parse_bridge_line(line: &str) -> Option<BridgeEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str::<BridgeRecord>(trimmed)
        .ok()
        .map(BridgeRecord::into_event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_is_versioned() {
        let line = BridgeRequest::process("abc", "gemini-live", "hi", vec!["TEXT".into()])
            .to_line()
            .unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["action"], "process");
        assert_eq!(value["requestId"], "abc");
        assert_eq!(value["response_modalities"][0], "TEXT");
    }

    #[test]
    fn test_parse_status_and_ids() {
        assert_eq!(parse_bridge_line(r#"{"status":"ready"}"#), Some(BridgeEvent::Ready));
        assert_eq!(
            parse_bridge_line(r#"{"status":"initialized","method":"vertexai"}"#),
            Some(BridgeEvent::Ready)
        );
        assert_eq!(
            parse_bridge_line(r#"{"type":"text_chunk","text":"Hi","requestId":"r1"}"#),
            Some(BridgeEvent::TextChunk {
                request_id: "r1".into(),
                text: "Hi".into()
            })
        );
        assert_eq!(
            parse_bridge_line(r#"{"type":"complete","request_id":"r2"}"#),
            Some(BridgeEvent::Complete {
                request_id: "r2".into(),
                text: None
            })
        );
    }

    #[test]
    fn test_parse_error_and_noise() {
        assert_eq!(
            parse_bridge_line(r#"{"type":"error","message":"boom","request_id":"r3","trying_next":true}"#),
            Some(BridgeEvent::Error {
                request_id: Some("r3".into()),
                message: "boom".into(),
                trying_next: true
            })
        );
        assert_eq!(parse_bridge_line("Traceback (most recent call last):"), None);
        assert_eq!(parse_bridge_line("   "), None);
    }
}
