//! 客户端协议数据模型
//!
//! 客户端与中继之间的 JSON 帧：setup / clientContent 入站，
//! setupComplete / serverContent / error 出站

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 模型名前缀（客户端常带此前缀）
pub const MODEL_PREFIX: &str = "models/";

/// 默认响应模态
pub const DEFAULT_RESPONSE_MODALITY: &str = "TEXT";

/// 客户端入站帧
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    pub setup: Option<SetupPayload>,
    pub client_content: Option<ClientContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: Option<String>,
    pub generation_config: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    #[serde(default)]
    pub turns: Vec<ContentTurn>,
    /// 旧版客户端直接发送 parts
    #[serde(default)]
    pub parts: Vec<ContentPart>,
    pub turn_complete: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContentTurn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContentPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ClientContent {
    /// 按顺序收集全部非空文本段（先 turns，没有时退回旧版 parts）
    pub fn text_segments(&self) -> Vec<String> {
        let from_turns: Vec<String> = self
            .turns
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.text.clone())
            .filter(|text| !text.trim().is_empty())
            .collect();
        if !from_turns.is_empty() {
            return from_turns;
        }
        self.parts
            .iter()
            .filter_map(|part| part.text.clone())
            .filter(|text| !text.trim().is_empty())
            .collect()
    }
}

/// 去掉 `models/` 前缀
pub fn normalize_model_name(model: &str) -> String {
    model
        .trim()
        .strip_prefix(MODEL_PREFIX)
        .unwrap_or(model.trim())
        .to_string()
}

/// 生成请求
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    /// 关联 ID
    pub id: String,
    /// 客户端期望的模型（已去前缀）
    pub model: String,
    /// 按顺序排列的文本段
    pub parts: Vec<String>,
    pub response_modalities: Vec<String>,
    /// 客户端在 setup 中提供的生成参数
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, parts: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: normalize_model_name(&model.into()),
            parts,
            response_modalities: vec![DEFAULT_RESPONSE_MODALITY.to_string()],
            generation_config: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_generation_config(mut self, config: Option<Value>) -> Self {
        if let Some(modalities) = config
            .as_ref()
            .and_then(|c| c.get("responseModalities"))
            .and_then(|m| m.as_array())
        {
            let modalities: Vec<String> = modalities
                .iter()
                .filter_map(|m| m.as_str().map(str::to_string))
                .collect();
            if !modalities.is_empty() {
                self.response_modalities = modalities;
            }
        }
        self.generation_config = config;
        self
    }

    /// 拼接后的提示文本（以空格连接）
    pub fn prompt_text(&self) -> String {
        self.parts.join(" ")
    }
}

/// 发往客户端的帧
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Json(Value),
    Close { code: u16, reason: String },
}

/// `{setupComplete:true}`；同时带上旧字段名兼容老客户端
pub fn setup_complete_message() -> Value {
    json!({
        "setupComplete": true,
        "BidiGenerateContentSetupComplete": true,
    })
}

/// 流式文本块 `{serverContent:{parts:[{text}]}}`
pub fn text_chunk_message(text: &str) -> Value {
    json!({
        "serverContent": {
            "parts": [{ "text": text }],
        }
    })
}

/// 轮次结束聚合消息，两种形状同时提供
pub fn turn_complete_message(text: &str) -> Value {
    json!({
        "serverContent": {
            "modelTurn": { "parts": [{ "text": text }] },
            "parts": [{ "text": text }],
            "turnComplete": true,
        }
    })
}

/// 错误信封 `{error:{message, code}}`
pub fn error_message(message: &str, code: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "code": code,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turns_take_precedence_over_legacy_parts() {
        let envelope: ClientEnvelope = serde_json::from_value(json!({
            "clientContent": {
                "turns": [{"role": "user", "parts": [{"text": "hello"}, {"text": "there"}]}],
                "parts": [{"text": "ignored"}],
                "turnComplete": true
            }
        }))
        .unwrap();
        let content = envelope.client_content.unwrap();
        assert_eq!(content.text_segments(), vec!["hello", "there"]);
        assert_eq!(content.turn_complete, Some(true));
    }

    #[test]
    fn test_legacy_parts() {
        let envelope: ClientEnvelope = serde_json::from_value(json!({
            "clientContent": {"parts": [{"text": "legacy"}, {"text": "  "}]}
        }))
        .unwrap();
        assert_eq!(
            envelope.client_content.unwrap().text_segments(),
            vec!["legacy"]
        );
    }

    #[test]
    fn test_normalize_model_name() {
        assert_eq!(normalize_model_name("models/gemini-live-2.5-flash"), "gemini-live-2.5-flash");
        assert_eq!(normalize_model_name("gemini-2.5-flash"), "gemini-2.5-flash");
    }

    #[test]
    fn test_generation_request_modalities() {
        let request = GenerationRequest::new("models/m", vec!["a".into(), "b".into()])
            .with_generation_config(Some(json!({"responseModalities": ["AUDIO"]})));
        assert_eq!(request.model, "m");
        assert_eq!(request.response_modalities, vec!["AUDIO"]);
        assert_eq!(request.prompt_text(), "a b");
        assert!(!request.id.is_empty());
    }

    #[test]
    fn test_turn_complete_shape() {
        let message = turn_complete_message("Hello world");
        assert_eq!(
            message["serverContent"]["modelTurn"]["parts"][0]["text"],
            "Hello world"
        );
        assert_eq!(message["serverContent"]["parts"][0]["text"], "Hello world");
        assert_eq!(message["serverContent"]["turnComplete"], true);
    }
}
