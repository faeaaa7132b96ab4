//! 健康监控类型定义
//!
//! 定义错误记录、检查结果、统计快照等核心类型

use crate::resilience::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 检查状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// 正常
    Healthy,
    /// 可用但异常
    Degraded,
    /// 不可用
    Unhealthy,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Healthy => write!(f, "healthy"),
            CheckStatus::Degraded => write!(f, "degraded"),
            CheckStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// 错误记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    /// 客户端错误码，如 `UPSTREAM_TRANSPORT_ERROR`
    pub code: String,
    /// 已脱敏的错误消息
    pub message: String,
    /// 发生位置（策略名、连接 ID 等）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// 单项检查结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
    pub duration_ms: u64,
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    pub fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
            duration_ms: 0,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Healthy, detail)
    }

    pub fn degraded(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Degraded, detail)
    }

    pub fn unhealthy(name: &str, detail: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Unhealthy, detail)
    }
}

/// 健康统计快照
#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub status: CheckStatus,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub total_errors: u64,
    pub errors_by_category: HashMap<ErrorCategory, u64>,
    /// 当前滑动窗口内的错误数
    pub window_errors: usize,
    pub error_threshold: usize,
    pub recovery_cycles: u64,
    pub check_runs: u64,
    pub active_connections: usize,
    pub last_checks: Vec<CheckResult>,
}
