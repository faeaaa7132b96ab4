//! 中继错误类型
//!
//! 定义网关、协商、上游、子进程桥接各层共用的错误分类，
//! 以及向客户端输出的结构化错误信封。

use crate::models::error_message;
use crate::negotiator::NegotiationFailure;
use serde_json::Value;
use thiserror::Error;

/// 生产环境下对客户端隐藏细节时使用的通用消息
pub const GENERIC_CLIENT_MESSAGE: &str = "Upstream generation failed, please retry later";

/// 中继错误
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// 网关层拒绝（origin / auth / 连接数 / 速率 / 负载大小）
    #[error("客户端被拒绝 ({status}): {reason}")]
    ClientRejected { status: u16, reason: String },

    /// 某个模型名的全部格式组合都已失败
    #[error("格式协商失败: {0}")]
    NegotiationExhausted(NegotiationFailure),

    /// 全部上游策略都已失败
    #[error("所有上游策略均失败: {last}")]
    StrategyExhausted { last: Box<RelayError> },

    /// 上游传输错误（连接失败、网络中断）
    #[error("上游传输错误: {0}")]
    UpstreamTransport(String),

    /// 上游协议错误（消息结构异常、HTTP 非 2xx）
    #[error("上游协议错误: {message}")]
    UpstreamProtocol {
        status: Option<u16>,
        message: String,
    },

    /// 子进程退出或崩溃
    #[error("子进程错误: {0}")]
    SubprocessCrashed(String),

    /// 超时
    #[error("超时: {0}")]
    Timeout(String),

    /// 凭证获取失败
    #[error("凭证错误: {0}")]
    Credential(String),

    /// 配置不可用（桥接未启用、端点地址无效）
    #[error("配置错误: {0}")]
    Config(String),

    /// 同一连接上已有进行中的轮次
    #[error("当前轮次尚未结束")]
    TurnInProgress,
}

impl RelayError {
    pub fn protocol(message: impl Into<String>) -> Self {
        RelayError::UpstreamProtocol {
            status: None,
            message: message.into(),
        }
    }

    pub fn protocol_with_status(status: u16, message: impl Into<String>) -> Self {
        RelayError::UpstreamProtocol {
            status: Some(status),
            message: message.into(),
        }
    }

    /// 机器可读的错误码，写入客户端错误信封的 `code` 字段
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::ClientRejected { .. } => "CLIENT_REJECTED",
            RelayError::NegotiationExhausted(_) => "NEGOTIATION_EXHAUSTED",
            RelayError::StrategyExhausted { .. } => "STRATEGY_EXHAUSTED",
            RelayError::UpstreamTransport(_) => "UPSTREAM_TRANSPORT_ERROR",
            RelayError::UpstreamProtocol { .. } => "UPSTREAM_PROTOCOL_ERROR",
            RelayError::SubprocessCrashed(_) => "SUBPROCESS_CRASHED",
            RelayError::Timeout(_) => "TIMEOUT",
            RelayError::Credential(_) => "CREDENTIAL_ERROR",
            RelayError::Config(_) => "CONFIG_ERROR",
            RelayError::TurnInProgress => "TURN_IN_PROGRESS",
        }
    }

    /// 对应的 HTTP 状态码（诊断接口与握手拒绝使用）
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::ClientRejected { status, .. } => *status,
            RelayError::UpstreamProtocol {
                status: Some(status),
                ..
            } => *status,
            RelayError::Timeout(_) => 504,
            RelayError::Credential(_) => 401,
            RelayError::Config(_) => 500,
            RelayError::TurnInProgress => 409,
            _ => 502,
        }
    }

    /// 上游 HTTP 状态码（如果有）
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            RelayError::UpstreamProtocol { status, .. } => *status,
            RelayError::StrategyExhausted { last } => last.upstream_status(),
            _ => None,
        }
    }

    /// 展开 StrategyExhausted 包装，取得最内层错误
    pub fn root(&self) -> &RelayError {
        match self {
            RelayError::StrategyExhausted { last } => last.root(),
            other => other,
        }
    }

    /// 构造客户端错误信封 `{error:{message, code}}`
    ///
    /// 生产环境只暴露通用消息，错误码保持不变
    pub fn to_client_envelope(&self, production: bool) -> Value {
        let message = if production && !matches!(self, RelayError::TurnInProgress) {
            GENERIC_CLIENT_MESSAGE.to_string()
        } else {
            crate::logger::sanitize_log_message(&self.to_string())
        };
        error_message(&message, self.code())
    }
}
