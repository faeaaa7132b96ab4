//! SDK 流式回退
//!
//! Live 路径全部失败时，改用普通模型的 `:streamGenerateContent?alt=sse` 接口。
//! API Key 走 generativelanguage REST，Bearer token 走 Vertex AI REST。

use super::traits::{TokenSource, UpstreamCredential};
use crate::config::UpstreamConfig;
use crate::error::RelayError;
use crate::models::GenerationRequest;
use crate::negotiator::{DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_TEMPERATURE};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// 默认 generativelanguage REST 地址
const DEFAULT_GENERATIVE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Live 专用模型名中的标记，REST 接口不接受这些模型
const LIVE_ONLY_MARKERS: &[&str] = &["live", "native-audio"];

/// 将 Live 模型替换为 REST 可用的模型
pub fn resolve_sdk_model(requested: &str, fallback: &str) -> String {
    let lower = requested.to_lowercase();
    if requested.trim().is_empty() || LIVE_ONLY_MARKERS.iter().any(|m| lower.contains(m)) {
        fallback.to_string()
    } else {
        requested.to_string()
    }
}

/// 从一条 SSE 数据中取出文本片段
pub fn extract_candidate_text(payload: &Value) -> String {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// SDK 回退客户端
pub struct SdkFallbackClient {
    client: Client,
    source: Arc<dyn TokenSource>,
    fallback_model: String,
    project_id: Option<String>,
    location: String,
    base_url: Option<String>,
}

impl SdkFallbackClient {
    pub fn new(client: Client, source: Arc<dyn TokenSource>, config: &UpstreamConfig) -> Self {
        Self {
            client,
            source,
            fallback_model: config.sdk_fallback_model.clone(),
            project_id: config.project_id.clone(),
            location: config.location.clone(),
            base_url: config.sdk_base_url.clone(),
        }
    }

    pub fn fallback_model(&self) -> &str {
        &self.fallback_model
    }

    /// 构造请求地址
    fn endpoint(&self, credential: &UpstreamCredential, model: &str) -> Result<String, RelayError> {
        match credential {
            UpstreamCredential::ApiKey(_) => Ok(format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url
                    .as_deref()
                    .unwrap_or(DEFAULT_GENERATIVE_BASE_URL)
                    .trim_end_matches('/'),
                model
            )),
            UpstreamCredential::Bearer { .. } => {
                let project = self.project_id.as_deref().ok_or_else(|| {
                    RelayError::Credential(
                        "project_id is required for bearer SDK fallback".to_string(),
                    )
                })?;
                let base = self.base_url.clone().unwrap_or_else(|| {
                    format!("https://{}-aiplatform.googleapis.com/v1", self.location)
                });
                Ok(format!(
                    "{}/projects/{}/locations/{}/publishers/google/models/{}:streamGenerateContent?alt=sse",
                    base.trim_end_matches('/'),
                    project,
                    self.location,
                    model
                ))
            }
        }
    }

    /// 构造请求体；responseModalities 是 Live 专用字段，不传给 REST
    pub fn build_body(request: &GenerationRequest) -> Value {
        let mut generation_config = Map::new();
        generation_config.insert("temperature".to_string(), json!(DEFAULT_TEMPERATURE));
        generation_config.insert(
            "maxOutputTokens".to_string(),
            json!(DEFAULT_MAX_OUTPUT_TOKENS),
        );
        if let Some(Value::Object(overrides)) = request.generation_config.as_ref() {
            for (key, value) in overrides {
                if key != "responseModalities" {
                    generation_config.insert(key.clone(), value.clone());
                }
            }
        }

        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": request.prompt_text() }]
            }],
            "generationConfig": Value::Object(generation_config),
        })
    }

    /// 发出请求并检查状态码，返回待读取的流式响应
    pub async fn open_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<reqwest::Response, RelayError> {
        let credential = self.source.credential().await?;
        let model = resolve_sdk_model(&request.model, &self.fallback_model);
        let url = self.endpoint(&credential, &model)?;

        tracing::info!(
            "[SDK_FALLBACK] 请求 {} (requested={}, mode={})",
            model,
            request.model,
            credential.mode()
        );

        let builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&Self::build_body(request));
        let builder = match &credential {
            UpstreamCredential::ApiKey(key) => builder.header("x-goog-api-key", key),
            UpstreamCredential::Bearer { token } => builder.bearer_auth(token),
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::Timeout(format!("sdk fallback request: {}", e))
            } else {
                RelayError::UpstreamTransport(format!("sdk fallback request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::protocol_with_status(
                status.as_u16(),
                format!("sdk fallback returned HTTP {}: {}", status, body.trim()),
            ));
        }
        Ok(response)
    }

    /// 读取 SSE 流，每个文本片段回调一次，返回完整文本
    pub async fn read_stream<F>(response: reqwest::Response, mut on_text: F) -> Result<String, RelayError>
    where
        F: FnMut(&str),
    {
        let mut stream = response.bytes_stream().eventsource();
        let mut full_text = String::new();

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| {
                RelayError::UpstreamTransport(format!("sdk fallback stream error: {}", e))
            })?;
            let data = event.data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            let payload: Value = serde_json::from_str(data).map_err(|e| {
                RelayError::protocol(format!("sdk fallback returned invalid JSON: {}", e))
            })?;
            if let Some(error) = payload.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("sdk fallback stream reported an error");
                let status = error
                    .get("code")
                    .and_then(Value::as_u64)
                    .and_then(|code| u16::try_from(code).ok());
                return Err(RelayError::UpstreamProtocol {
                    status,
                    message: message.to_string(),
                });
            }

            let text = extract_candidate_text(&payload);
            if !text.is_empty() {
                on_text(&text);
                full_text.push_str(&text);
            }
        }

        tracing::debug!("[SDK_FALLBACK] 流结束，共 {} 字符", full_text.chars().count());
        Ok(full_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StaticTokenSource;
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/v1beta", addr)
    }

    fn client_for(base_url: String) -> SdkFallbackClient {
        let config = UpstreamConfig {
            sdk_base_url: Some(base_url),
            ..Default::default()
        };
        SdkFallbackClient::new(
            Client::new(),
            Arc::new(StaticTokenSource::new(UpstreamCredential::ApiKey("k".into()))),
            &config,
        )
    }

    #[test]
    fn test_resolve_sdk_model() {
        assert_eq!(
            resolve_sdk_model("gemini-live-2.5-flash", "gemini-2.5-flash"),
            "gemini-2.5-flash"
        );
        assert_eq!(
            resolve_sdk_model("gemini-2.5-flash-native-audio-preview-09-2025", "gemini-2.5-flash"),
            "gemini-2.5-flash"
        );
        assert_eq!(resolve_sdk_model("gemini-2.5-pro", "gemini-2.5-flash"), "gemini-2.5-pro");
        assert_eq!(resolve_sdk_model("", "gemini-2.5-flash"), "gemini-2.5-flash");
    }

    #[test]
    fn test_body_drops_response_modalities() {
        let request = GenerationRequest::new("m", vec!["a".into(), "b".into()])
            .with_generation_config(Some(json!({"temperature": 0.1, "responseModalities": ["TEXT"]})));
        let body = SdkFallbackClient::build_body(&request);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "a b");
        assert_eq!(body["generationConfig"]["temperature"], 0.1);
        assert!(body["generationConfig"].get("responseModalities").is_none());
    }

    #[test]
    fn test_bearer_endpoint_requires_project() {
        let client = client_for("http://unused".into());
        let err = client
            .endpoint(&UpstreamCredential::Bearer { token: "t".into() }, "m")
            .unwrap_err();
        assert!(matches!(err, RelayError::Credential(_)));
    }

    #[tokio::test]
    async fn test_streams_sse_chunks() {
        let router = Router::new().fallback(|| async {
            let body = concat!(
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello \"}]}}]}\n\n",
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"world\"}]}}]}\n\n",
            );
            ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
        });
        let client = client_for(serve(router).await);

        let request = GenerationRequest::new("gemini-live-2.5-flash", vec!["hi".into()]);
        let response = client.open_stream(&request).await.unwrap();
        let mut chunks = Vec::new();
        let text = SdkFallbackClient::read_stream(response, |t| chunks.push(t.to_string()))
            .await
            .unwrap();

        assert_eq!(chunks, vec!["Hello ", "world"]);
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn test_http_error_carries_status() {
        let router = Router::new().fallback(|| async {
            (axum::http::StatusCode::FORBIDDEN, "permission denied").into_response()
        });
        let client = client_for(serve(router).await);

        let request = GenerationRequest::new("gemini-2.5-flash", vec!["hi".into()]);
        let err = client.open_stream(&request).await.unwrap_err();
        assert_eq!(err.upstream_status(), Some(403));
    }
}
