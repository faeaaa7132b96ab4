//! 模型名格式与内容信封格式
//!
//! 上游接受的模型标识与内容消息结构会变化，这里列出已知的候选形状，
//! 按尝试顺序排列

use serde::Serialize;
use serde_json::{json, Map, Value};

/// 默认生成参数
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 8192;

/// 渲染模型标识所需的上下文
#[derive(Debug, Clone, Default)]
pub struct FormatContext {
    pub project_id: Option<String>,
    pub location: String,
}

/// 模型名格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModelFormat {
    /// `models/{m}`
    Prefixed,
    /// `projects/{p}/locations/{l}/publishers/google/models/{m}`
    VertexResource,
    /// `{m}`
    Bare,
    /// `publishers/google/models/{m}`
    PublisherPath,
}

impl ModelFormat {
    pub const DEFAULT_ORDER: [ModelFormat; 4] = [
        ModelFormat::Prefixed,
        ModelFormat::VertexResource,
        ModelFormat::Bare,
        ModelFormat::PublisherPath,
    ];

    /// 渲染模型标识；缺少项目 ID 时 VertexResource 无法渲染
    pub fn render(&self, model: &str, context: &FormatContext) -> Option<String> {
        match self {
            ModelFormat::Prefixed => Some(format!("models/{}", model)),
            ModelFormat::VertexResource => context.project_id.as_ref().map(|project| {
                format!(
                    "projects/{}/locations/{}/publishers/google/models/{}",
                    project, context.location, model
                )
            }),
            ModelFormat::Bare => Some(model.to_string()),
            ModelFormat::PublisherPath => Some(format!("publishers/google/models/{}", model)),
        }
    }
}

/// 内容信封格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentFormat {
    /// turns 带 role，turnComplete: true
    RoleTurnComplete,
    /// turns 带 role，turnComplete: false
    RoleTurnOpen,
    /// turns 带 role，不带 turnComplete
    RoleNoFlag,
    /// turns 不带 role，turnComplete: true
    NoRoleTurnComplete,
}

impl ContentFormat {
    pub const DEFAULT_ORDER: [ContentFormat; 4] = [
        ContentFormat::RoleTurnComplete,
        ContentFormat::RoleTurnOpen,
        ContentFormat::RoleNoFlag,
        ContentFormat::NoRoleTurnComplete,
    ];

    pub fn render(&self, text: &str) -> Value {
        let parts = json!([{ "text": text }]);
        let with_role = json!([{ "role": "user", "parts": parts }]);
        let without_role = json!([{ "parts": parts }]);

        let content = match self {
            ContentFormat::RoleTurnComplete => json!({ "turns": with_role, "turnComplete": true }),
            ContentFormat::RoleTurnOpen => json!({ "turns": with_role, "turnComplete": false }),
            ContentFormat::RoleNoFlag => json!({ "turns": with_role }),
            ContentFormat::NoRoleTurnComplete => {
                json!({ "turns": without_role, "turnComplete": true })
            }
        };
        json!({ "clientContent": content })
    }
}

/// 构造 setup 消息
///
/// 客户端提供的 generationConfig 字段覆盖默认值
pub fn build_setup_message(
    model_id: &str,
    response_modalities: &[String],
    client_config: Option<&Value>,
) -> Value {
    let mut generation_config = Map::new();
    generation_config.insert("temperature".to_string(), json!(DEFAULT_TEMPERATURE));
    generation_config.insert(
        "maxOutputTokens".to_string(),
        json!(DEFAULT_MAX_OUTPUT_TOKENS),
    );
    generation_config.insert("responseModalities".to_string(), json!(response_modalities));

    if let Some(Value::Object(overrides)) = client_config {
        for (key, value) in overrides {
            generation_config.insert(key.clone(), value.clone());
        }
    }

    json!({
        "setup": {
            "model": model_id,
            "generationConfig": Value::Object(generation_config),
        }
    })
}
