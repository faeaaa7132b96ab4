//! 格式协商
//!
//! 对 (模型名格式 × 内容信封格式) 做有界搜索：
//! 外层遍历模型名格式，内层遍历内容格式，每个组合打开一次上游连接。
//! 关闭事件经决策表决定下一步；setup 一旦确认，模型名格式即被冻结。
//! 每个模型名最多尝试 M×N 次，同一请求内任一组合不会重复尝试。

mod decision;
mod formats;

pub use decision::{
    decide, CloseClass, CloseSignal, NextAction, CLOSE_ABNORMAL, CLOSE_INVALID_PAYLOAD,
    CLOSE_POLICY_VIOLATION,
    INVALID_RESOURCE_KEYWORDS, MODEL_NOT_FOUND_KEYWORDS, PERMISSION_DENIED_KEYWORDS,
    UNKNOWN_FIELD_KEYWORDS,
};
pub use formats::{
    build_setup_message, ContentFormat, FormatContext, ModelFormat, DEFAULT_MAX_OUTPUT_TOKENS,
    DEFAULT_TEMPERATURE,
};

use crate::error::RelayError;
use crate::models::GenerationRequest;
use crate::resilience::TimeoutController;
use crate::translator::TurnRelay;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// 一次协商尝试的计划
#[derive(Debug, Clone)]
pub struct AttemptPlan {
    pub model_format_index: usize,
    pub content_format_index: usize,
    /// 渲染后的模型标识
    pub model_id: String,
    pub setup: Value,
    pub content: Value,
}

/// 单次尝试的结果
#[derive(Debug)]
pub enum AttemptOutcome {
    /// 收到完成信号
    Completed,
    /// 上游关闭连接
    Closed(CloseSignal),
    /// 传输层失败（连接失败、握手被拒等）
    Failed(RelayError),
}

/// 上游传输
///
/// 一次 `attempt` 对应一个上游连接：发送 setup，等待确认后发送内容，
/// 读取到完成或关闭为止。收到的消息交给 `relay` 转发。
#[async_trait]
pub trait LiveTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn attempt(&self, plan: &AttemptPlan, relay: &mut TurnRelay) -> AttemptOutcome;
}

/// 尝试状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptState {
    Pending,
    Accepted,
    Rejected,
}

/// 协商尝试记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NegotiationAttempt {
    pub model_format_index: usize,
    pub content_format_index: usize,
    pub state: AttemptState,
    pub close_code: Option<u16>,
    pub close_reason: Option<String>,
}

/// 失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationFailureKind {
    /// 格式组合已穷尽
    Exhausted,
    /// 遇到不可在格式层面恢复的错误，直接上抛
    Escalated,
}

/// 协商失败（带标签，不需要再解析字符串）
#[derive(Debug, Clone)]
pub struct NegotiationFailure {
    pub kind: NegotiationFailureKind,
    pub model_name: String,
    pub model_format_index: usize,
    pub content_format_index: usize,
    pub reason: String,
    /// 上抛时的底层错误
    pub cause: Option<Box<RelayError>>,
    pub attempts: Vec<NegotiationAttempt>,
}

impl fmt::Display for NegotiationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            NegotiationFailureKind::Exhausted => "exhausted",
            NegotiationFailureKind::Escalated => "escalated",
        };
        write!(
            f,
            "{} {} at (model_format={}, content_format={}): {}",
            self.model_name, kind, self.model_format_index, self.content_format_index, self.reason
        )
    }
}

/// 协商成功
#[derive(Debug, Clone)]
pub struct NegotiationSuccess {
    pub model_id: String,
    pub model_format_index: usize,
    pub content_format_index: usize,
    pub text: String,
    pub attempts: Vec<NegotiationAttempt>,
}

/// 格式协商器
pub struct FormatNegotiator {
    model_formats: Vec<ModelFormat>,
    content_formats: Vec<ContentFormat>,
    context: FormatContext,
    attempt_timeout: TimeoutController,
}

impl FormatNegotiator {
    pub fn new(context: FormatContext, attempt_timeout: Duration) -> Self {
        Self {
            model_formats: ModelFormat::DEFAULT_ORDER.to_vec(),
            content_formats: ContentFormat::DEFAULT_ORDER.to_vec(),
            context,
            attempt_timeout: TimeoutController::new("negotiation attempt", attempt_timeout),
        }
    }

    pub fn with_formats(
        mut self,
        model_formats: Vec<ModelFormat>,
        content_formats: Vec<ContentFormat>,
    ) -> Self {
        self.model_formats = model_formats;
        self.content_formats = content_formats;
        self
    }

    pub fn model_formats(&self) -> &[ModelFormat] {
        &self.model_formats
    }

    pub fn content_formats(&self) -> &[ContentFormat] {
        &self.content_formats
    }

    /// 对一个模型名执行协商
    pub async fn negotiate(
        &self,
        transport: &dyn LiveTransport,
        request: &GenerationRequest,
        model_name: &str,
        relay: &mut TurnRelay,
    ) -> Result<NegotiationSuccess, NegotiationFailure> {
        let model_count = self.model_formats.len();
        let content_count = self.content_formats.len();
        let prompt = request.prompt_text();

        let mut visited: HashSet<(usize, usize)> = HashSet::new();
        let mut attempts: Vec<NegotiationAttempt> = Vec::new();
        let mut frozen_model_format: Option<usize> = None;
        let mut last_reason = String::from("no model format could be rendered");
        let mut model_index = 0usize;
        let mut content_index = 0usize;

        let failure = |kind,
                       m: usize,
                       c: usize,
                       reason: String,
                       cause: Option<RelayError>,
                       attempts: Vec<NegotiationAttempt>| NegotiationFailure {
            kind,
            model_name: model_name.to_string(),
            model_format_index: m,
            content_format_index: c,
            reason,
            cause: cause.map(Box::new),
            attempts,
        };

        while model_index < model_count && content_index < content_count {
            let model_format = self.model_formats[model_index];
            let Some(model_id) = model_format.render(model_name, &self.context) else {
                tracing::debug!(
                    "[NEGOTIATOR] 跳过无法渲染的模型名格式 {:?} ({})",
                    model_format,
                    model_name
                );
                model_index += 1;
                content_index = 0;
                continue;
            };

            if !visited.insert((model_index, content_index)) {
                break;
            }

            let plan = AttemptPlan {
                model_format_index: model_index,
                content_format_index: content_index,
                setup: build_setup_message(
                    &model_id,
                    &request.response_modalities,
                    request.generation_config.as_ref(),
                ),
                content: self.content_formats[content_index].render(&prompt),
                model_id,
            };

            tracing::info!(
                "[NEGOTIATOR] {} 尝试 model_format={} content_format={} model={}",
                transport.name(),
                model_index,
                content_index,
                plan.model_id
            );

            relay.begin_attempt();
            let mut record = NegotiationAttempt {
                model_format_index: model_index,
                content_format_index: content_index,
                state: AttemptState::Pending,
                close_code: None,
                close_reason: None,
            };

            let outcome = match self
                .attempt_timeout
                .execute_with_timeout(transport.attempt(&plan, relay))
                .await
            {
                Ok(outcome) => outcome,
                Err(timeout) => AttemptOutcome::Failed(timeout.into()),
            };

            match outcome {
                AttemptOutcome::Completed => {
                    record.state = AttemptState::Accepted;
                    attempts.push(record);
                    return Ok(NegotiationSuccess {
                        model_id: plan.model_id,
                        model_format_index: model_index,
                        content_format_index: content_index,
                        text: relay.text().to_string(),
                        attempts,
                    });
                }
                AttemptOutcome::Failed(error) => {
                    record.state = AttemptState::Rejected;
                    attempts.push(record);
                    tracing::warn!(
                        "[NEGOTIATOR] {} 传输失败，放弃模型 {}: {}",
                        transport.name(),
                        model_name,
                        error
                    );
                    return Err(failure(
                        NegotiationFailureKind::Escalated,
                        model_index,
                        content_index,
                        error.to_string(),
                        Some(error),
                        attempts,
                    ));
                }
                AttemptOutcome::Closed(signal) => {
                    record.close_code = Some(signal.code);
                    record.close_reason = Some(signal.reason.clone());
                    if signal.setup_acknowledged {
                        frozen_model_format = Some(model_index);
                    }
                    last_reason = format!("close {}: {}", signal.code, signal.reason);

                    let action = signal.next_action();
                    tracing::info!(
                        "[NEGOTIATOR] 上游关闭 code={} class={:?} acked={} -> {:?}",
                        signal.code,
                        signal.class(),
                        signal.setup_acknowledged,
                        action
                    );

                    match action {
                        NextAction::Accept => {
                            record.state = AttemptState::Accepted;
                            attempts.push(record);
                            return Ok(NegotiationSuccess {
                                model_id: plan.model_id,
                                model_format_index: model_index,
                                content_format_index: content_index,
                                text: relay.text().to_string(),
                                attempts,
                            });
                        }
                        NextAction::AdvanceModelFormat => {
                            record.state = AttemptState::Rejected;
                            attempts.push(record);
                            if frozen_model_format.is_some() {
                                break;
                            }
                            model_index += 1;
                            content_index = 0;
                        }
                        NextAction::AdvanceContentFormat => {
                            record.state = AttemptState::Rejected;
                            attempts.push(record);
                            content_index += 1;
                            if content_index >= content_count {
                                // 内容格式穷尽后走模型格式推进路径；模型格式已冻结时结束
                                if frozen_model_format.is_some() {
                                    break;
                                }
                                model_index += 1;
                                content_index = 0;
                            }
                        }
                        NextAction::Escalate => {
                            record.state = AttemptState::Rejected;
                            attempts.push(record);
                            let cause = if signal.code == CLOSE_ABNORMAL {
                                RelayError::UpstreamTransport(last_reason.clone())
                            } else {
                                RelayError::protocol(last_reason.clone())
                            };
                            return Err(failure(
                                NegotiationFailureKind::Escalated,
                                model_index,
                                content_index,
                                last_reason,
                                Some(cause),
                                attempts,
                            ));
                        }
                    }
                }
            }
        }

        let (m, c) = attempts
            .last()
            .map(|a| (a.model_format_index, a.content_format_index))
            .unwrap_or((0, 0));
        tracing::warn!(
            "[NEGOTIATOR] 模型 {} 的格式组合已穷尽 ({} 次尝试)",
            model_name,
            attempts.len()
        );
        Err(failure(
            NegotiationFailureKind::Exhausted,
            m,
            c,
            last_reason,
            None,
            attempts,
        ))
    }
}
