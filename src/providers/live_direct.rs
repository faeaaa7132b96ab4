//! 直连 Live WebSocket 传输
//!
//! 一次 `attempt` 打开一个上游连接：发送 setup，收到 setup 确认后发送内容，
//! 然后把上游消息交给 `TurnRelay`，直到完成信号或关闭帧。
//! API Key 走 generativelanguage 端点，Bearer token 走 Vertex 区域端点。

use super::traits::{TokenSource, UpstreamCredential};
use crate::error::RelayError;
use crate::negotiator::{AttemptOutcome, AttemptPlan, CloseSignal, LiveTransport, CLOSE_ABNORMAL};
use crate::translator::{extract_text_fragments, is_setup_ack, TurnRelay};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};

/// API Key 模式的 Live 端点
pub const API_KEY_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService/BidiGenerateContent";

/// Vertex 区域端点
pub fn vertex_live_endpoint(location: &str) -> String {
    format!(
        "wss://{}-aiplatform.googleapis.com/ws/google.cloud.aiplatform.v1beta1.LlmBidiService/BidiGenerateContent",
        location
    )
}

/// 直连 Live 传输
pub struct DirectLiveTransport {
    source: Arc<dyn TokenSource>,
    location: String,
    api_key_endpoint: String,
    bearer_endpoint: Option<String>,
}

impl DirectLiveTransport {
    pub fn new(source: Arc<dyn TokenSource>, location: impl Into<String>) -> Self {
        Self {
            source,
            location: location.into(),
            api_key_endpoint: API_KEY_LIVE_ENDPOINT.to_string(),
            bearer_endpoint: None,
        }
    }

    /// 覆盖 API Key 模式端点
    pub fn with_api_key_endpoint(mut self, endpoint: Option<String>) -> Self {
        if let Some(endpoint) = endpoint {
            self.api_key_endpoint = endpoint;
        }
        self
    }

    /// 覆盖 Bearer 模式端点
    pub fn with_bearer_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.bearer_endpoint = endpoint;
        self
    }

    /// 按凭证构造握手请求
    fn build_request(
        &self,
        credential: &UpstreamCredential,
    ) -> Result<tungstenite::handshake::client::Request, RelayError> {
        let (url, header) = match credential {
            UpstreamCredential::ApiKey(key) => (
                format!(
                    "{}?key={}",
                    self.api_key_endpoint,
                    urlencoding::encode(key)
                ),
                ("x-goog-api-key", key.clone()),
            ),
            UpstreamCredential::Bearer { token } => (
                self.bearer_endpoint
                    .clone()
                    .unwrap_or_else(|| vertex_live_endpoint(&self.location)),
                ("Authorization", format!("Bearer {}", token)),
            ),
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Config(format!("invalid live endpoint: {}", e)))?;
        let value = HeaderValue::from_str(&header.1)
            .map_err(|_| RelayError::Credential("credential contains invalid characters".into()))?;
        request.headers_mut().insert(header.0, value);
        Ok(request)
    }
}

/// 握手失败时区分 HTTP 拒绝与网络错误
fn map_connect_error(error: tungstenite::Error) -> RelayError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();
            RelayError::protocol_with_status(
                status,
                format!("live handshake rejected with HTTP {}: {}", status, body.trim()),
            )
        }
        other => RelayError::UpstreamTransport(format!("live connect failed: {}", other)),
    }
}

fn parse_frame(message: &Message) -> Option<Value> {
    match message {
        Message::Text(text) => serde_json::from_str(text).ok(),
        Message::Binary(bytes) => serde_json::from_slice(bytes).ok(),
        _ => None,
    }
}

#[async_trait]
impl LiveTransport for DirectLiveTransport {
    fn name(&self) -> &str {
        "direct-live"
    }

    async fn attempt(&self, plan: &AttemptPlan, relay: &mut TurnRelay) -> AttemptOutcome {
        let credential = match self.source.credential().await {
            Ok(credential) => credential,
            Err(e) => return AttemptOutcome::Failed(e),
        };
        let request = match self.build_request(&credential) {
            Ok(request) => request,
            Err(e) => return AttemptOutcome::Failed(e),
        };

        tracing::debug!(
            "[LIVE_DIRECT] 连接上游 mode={} credential={} model={}",
            credential.mode(),
            credential.masked(),
            plan.model_id
        );

        let (stream, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(connected) => connected,
            Err(e) => return AttemptOutcome::Failed(map_connect_error(e)),
        };
        let (mut write, mut read) = stream.split();

        if let Err(e) = write.send(Message::Text(plan.setup.to_string())).await {
            return AttemptOutcome::Failed(RelayError::UpstreamTransport(format!(
                "failed to send setup: {}",
                e
            )));
        }

        let mut setup_acknowledged = false;
        let mut received_text = false;

        while let Some(frame) = read.next().await {
            let message = match frame {
                Ok(message) => message,
                Err(e) => {
                    return AttemptOutcome::Failed(RelayError::UpstreamTransport(format!(
                        "live stream error: {}",
                        e
                    )))
                }
            };

            if let Message::Close(close) = message {
                let (code, reason) = close
                    .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                    .unwrap_or((u16::from(CloseCode::Status), String::new()));
                tracing::info!("[LIVE_DIRECT] 上游关闭 code={} reason={}", code, reason);
                return AttemptOutcome::Closed(CloseSignal {
                    code,
                    reason,
                    setup_acknowledged,
                    received_text,
                });
            }

            let Some(value) = parse_frame(&message) else {
                continue;
            };

            if is_setup_ack(&value) {
                if !setup_acknowledged {
                    setup_acknowledged = true;
                    tracing::debug!("[LIVE_DIRECT] setup 已确认，发送内容");
                    if let Err(e) = write.send(Message::Text(plan.content.to_string())).await {
                        return AttemptOutcome::Failed(RelayError::UpstreamTransport(format!(
                            "failed to send content: {}",
                            e
                        )));
                    }
                }
                continue;
            }

            if !extract_text_fragments(&value).is_empty() {
                received_text = true;
            }
            if relay.upstream_message(&value) {
                let _ = write.send(Message::Close(None)).await;
                return AttemptOutcome::Completed;
            }
        }

        AttemptOutcome::Closed(CloseSignal {
            code: CLOSE_ABNORMAL,
            reason: "connection closed without close frame".to_string(),
            setup_acknowledged,
            received_text,
        })
    }
}
