//! 三种上游策略

use super::{FailureRouter, UpstreamStrategy};
use crate::bridge::LiveBridge;
use crate::error::RelayError;
use crate::models::GenerationRequest;
use crate::negotiator::{FormatNegotiator, LiveTransport, NegotiationFailure, NegotiationFailureKind};
use crate::providers::{SdkFallbackClient, TokenSource};
use crate::resilience::ErrorCategory;
use crate::translator::TurnRelay;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 子进程桥接策略，仅在辅助进程就绪时参与
pub struct BridgeStrategy {
    bridge: Arc<LiveBridge>,
}

impl BridgeStrategy {
    pub fn new(bridge: Arc<LiveBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl UpstreamStrategy for BridgeStrategy {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn is_available(&self) -> bool {
        self.bridge.is_ready()
    }

    async fn run(&self, request: &GenerationRequest, relay: &mut TurnRelay) -> Result<(), RelayError> {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        let send = self.bridge.send_request(request, Some(chunk_tx));
        tokio::pin!(send);

        let result = loop {
            tokio::select! {
                biased;
                Some(chunk) = chunk_rx.recv() => relay.text_chunk(&chunk),
                result = &mut send => break result,
            }
        };
        // complete 之前到达的块可能还留在通道里
        while let Ok(chunk) = chunk_rx.try_recv() {
            relay.text_chunk(&chunk);
        }

        let text = result?;
        relay.complete(Some(text));
        Ok(())
    }
}

/// 协商失败转为错误：穷尽时保留标签，上抛时取底层错误
pub fn negotiation_error(failure: NegotiationFailure) -> RelayError {
    match failure.kind {
        NegotiationFailureKind::Escalated => match failure.cause {
            Some(cause) => *cause,
            None => RelayError::NegotiationExhausted(failure),
        },
        NegotiationFailureKind::Exhausted => RelayError::NegotiationExhausted(failure),
    }
}

/// 直连 Live 策略：对每个候选模型名做格式协商
pub struct DirectLiveStrategy {
    negotiator: FormatNegotiator,
    transport: Arc<dyn LiveTransport>,
    source: Arc<dyn TokenSource>,
    router: FailureRouter,
    live_models: Vec<String>,
}

impl DirectLiveStrategy {
    pub fn new(
        negotiator: FormatNegotiator,
        transport: Arc<dyn LiveTransport>,
        source: Arc<dyn TokenSource>,
        router: FailureRouter,
        live_models: Vec<String>,
    ) -> Self {
        Self {
            negotiator,
            transport,
            source,
            router,
            live_models,
        }
    }

    /// 请求的模型在前，其后是配置列表，去重
    pub fn candidate_models(&self, requested: &str) -> Vec<String> {
        let mut models: Vec<String> = Vec::new();
        for model in std::iter::once(requested).chain(self.live_models.iter().map(String::as_str)) {
            let model = model.trim();
            if !model.is_empty() && !models.iter().any(|m| m == model) {
                models.push(model.to_string());
            }
        }
        models
    }
}

#[async_trait]
impl UpstreamStrategy for DirectLiveStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn run(&self, request: &GenerationRequest, relay: &mut TurnRelay) -> Result<(), RelayError> {
        let credential = self
            .router
            .registry()
            .retry(ErrorCategory::UpstreamAuth, || self.source.credential())
            .await
            .into_result()?;
        tracing::debug!(
            "[ORCHESTRATOR] 直连使用 {} 凭证 ({})",
            credential.mode(),
            self.source.source_name()
        );

        let candidates = self.candidate_models(&request.model);
        let mut last_error: Option<RelayError> = None;

        for (index, model) in candidates.iter().enumerate() {
            match self
                .negotiator
                .negotiate(self.transport.as_ref(), request, model, relay)
                .await
            {
                Ok(success) => {
                    tracing::info!(
                        "[ORCHESTRATOR] 模型 {} 协商成功: {} (model_format={}, content_format={}, {} 次尝试)",
                        model,
                        success.model_id,
                        success.model_format_index,
                        success.content_format_index,
                        success.attempts.len()
                    );
                    return Ok(());
                }
                Err(failure) => {
                    let error = negotiation_error(failure);
                    // 最后一个模型的失败由编排器统一路由
                    if index + 1 < candidates.len() {
                        self.router.route(&error, model).await;
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RelayError::protocol("no live model candidates")))
    }
}

/// SDK 流式回退策略
pub struct SdkFallbackStrategy {
    client: SdkFallbackClient,
    router: FailureRouter,
}

impl SdkFallbackStrategy {
    pub fn new(client: SdkFallbackClient, router: FailureRouter) -> Self {
        Self { client, router }
    }
}

#[async_trait]
impl UpstreamStrategy for SdkFallbackStrategy {
    fn name(&self) -> &'static str {
        "sdk"
    }

    async fn run(&self, request: &GenerationRequest, relay: &mut TurnRelay) -> Result<(), RelayError> {
        let response = self
            .router
            .registry()
            .retry_classified(|| self.client.open_stream(request))
            .await
            .into_result()?;

        let text = SdkFallbackClient::read_stream(response, |chunk| relay.text_chunk(chunk)).await?;
        relay.complete(Some(text));
        Ok(())
    }
}
