//! 错误分类
//!
//! 先按错误类型匹配，再看状态码，最后按消息关键词兜底

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 认证类关键词
pub const AUTH_KEYWORDS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "permission denied",
    "api key",
    "invalid credentials",
    "access token",
    "401",
    "403",
];

/// 网络类关键词
pub const NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "econnrefused",
    "connection refused",
    "connection reset",
    "dns",
    "unreachable",
];

/// 会话类关键词（客户端连接、子进程）
pub const SESSION_KEYWORDS: &[&str] = &[
    "websocket",
    "socket closed",
    "process exited",
    "subprocess",
    "session",
];

/// 协议类关键词
pub const PROTOCOL_KEYWORDS: &[&str] = &[
    "unknown name",
    "cannot find field",
    "invalid resource",
    "not found",
    "malformed",
    "unexpected",
];

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    UpstreamAuth,
    UpstreamProtocol,
    UpstreamNetwork,
    SessionError,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::UpstreamAuth,
        ErrorCategory::UpstreamProtocol,
        ErrorCategory::UpstreamNetwork,
        ErrorCategory::SessionError,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UpstreamAuth => "UPSTREAM_AUTH",
            ErrorCategory::UpstreamProtocol => "UPSTREAM_PROTOCOL",
            ErrorCategory::UpstreamNetwork => "UPSTREAM_NETWORK",
            ErrorCategory::SessionError => "SESSION_ERROR",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }

    /// 对错误分类
    pub fn categorize(error: &RelayError) -> Self {
        match error {
            RelayError::Credential(_) => ErrorCategory::UpstreamAuth,
            RelayError::ClientRejected { status, .. } => match status {
                401 | 403 => ErrorCategory::UpstreamAuth,
                _ => ErrorCategory::SessionError,
            },
            RelayError::NegotiationExhausted(_) => ErrorCategory::UpstreamProtocol,
            RelayError::StrategyExhausted { last } => Self::categorize(last),
            RelayError::UpstreamTransport(message) => {
                match Self::categorize_message(message, None) {
                    ErrorCategory::UpstreamAuth => ErrorCategory::UpstreamAuth,
                    _ => ErrorCategory::UpstreamNetwork,
                }
            }
            RelayError::UpstreamProtocol { status, message } => {
                match Self::categorize_message(message, *status) {
                    ErrorCategory::Unknown => ErrorCategory::UpstreamProtocol,
                    other => other,
                }
            }
            RelayError::SubprocessCrashed(_) | RelayError::TurnInProgress => {
                ErrorCategory::SessionError
            }
            RelayError::Timeout(_) => ErrorCategory::UpstreamNetwork,
            RelayError::Config(_) => ErrorCategory::Unknown,
        }
    }

    /// 按状态码与消息关键词分类
    pub fn categorize_message(message: &str, status: Option<u16>) -> Self {
        match status {
            Some(401) | Some(403) => return ErrorCategory::UpstreamAuth,
            Some(408) | Some(502) | Some(503) | Some(504) => {
                return ErrorCategory::UpstreamNetwork
            }
            Some(400) | Some(404) | Some(422) => return ErrorCategory::UpstreamProtocol,
            _ => {}
        }

        let lower = message.to_lowercase();
        let contains_any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if contains_any(AUTH_KEYWORDS) {
            ErrorCategory::UpstreamAuth
        } else if contains_any(NETWORK_KEYWORDS) {
            ErrorCategory::UpstreamNetwork
        } else if contains_any(SESSION_KEYWORDS) {
            ErrorCategory::SessionError
        } else if contains_any(PROTOCOL_KEYWORDS) {
            ErrorCategory::UpstreamProtocol
        } else {
            ErrorCategory::Unknown
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
