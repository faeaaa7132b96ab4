//! 超时控制实现
//!
//! 为协商尝试、子进程请求和整轮对话提供统一的超时包装

use crate::error::RelayError;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

/// 超时错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimeoutError {
    /// 操作超时
    #[error("{operation} 超时: 配置 {timeout_ms}ms, 已耗时 {elapsed_ms}ms")]
    Elapsed {
        operation: &'static str,
        timeout_ms: u64,
        elapsed_ms: u64,
    },
}

impl From<TimeoutError> for RelayError {
    fn from(err: TimeoutError) -> Self {
        RelayError::Timeout(err.to_string())
    }
}

/// 超时控制器
#[derive(Debug, Clone)]
pub struct TimeoutController {
    operation: &'static str,
    timeout: Duration,
}

impl TimeoutController {
    /// 创建新的超时控制器
    ///
    /// `timeout` 为零表示不限时
    pub fn new(operation: &'static str, timeout: Duration) -> Self {
        Self { operation, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 带超时执行异步操作
    ///
    /// 超时后 `operation` 被丢弃，其持有的连接或进程句柄随之关闭
    pub async fn execute_with_timeout<F, T>(&self, operation: F) -> Result<T, TimeoutError>
    where
        F: Future<Output = T>,
    {
        if self.timeout.is_zero() {
            return Ok(operation.await);
        }

        let start = Instant::now();
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => Ok(result),
            Err(_) => Err(TimeoutError::Elapsed {
                operation: self.operation,
                timeout_ms: self.timeout.as_millis() as u64,
                elapsed_ms: start.elapsed().as_millis() as u64,
            }),
        }
    }
}
