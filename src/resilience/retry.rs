//! 重试机制实现
//!
//! 按类别配置的指数退避重试：第 n 次重试前等待 base * 2^n 毫秒

use super::category::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// 单次退避的上限，防止配置异常时溢出
const MAX_BACKOFF_MS: u64 = 10 * 60 * 1000;

/// 恢复策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryStrategy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 基础退避（毫秒）
    pub base_backoff_ms: u64,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_backoff_ms: 0,
        }
    }
}

impl RecoveryStrategy {
    pub fn new(max_retries: u32, base_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            base_backoff_ms,
        }
    }

    /// 第 n 次重试（从 0 开始）之前的等待时间
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_index).unwrap_or(u64::MAX);
        let delay = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(MAX_BACKOFF_MS);
        Duration::from_millis(delay)
    }

    /// 计算全部重试的退避序列
    pub fn compute_backoff_sequence(&self) -> Vec<Duration> {
        (0..self.max_retries)
            .map(|retry_index| self.backoff_delay(retry_index))
            .collect()
    }
}

impl ErrorCategory {
    /// 各类别的默认策略
    pub fn default_strategy(&self) -> RecoveryStrategy {
        match self {
            ErrorCategory::UpstreamAuth => RecoveryStrategy::new(1, 0),
            ErrorCategory::UpstreamProtocol => RecoveryStrategy::new(3, 1000),
            ErrorCategory::UpstreamNetwork => RecoveryStrategy::new(3, 3000),
            ErrorCategory::SessionError => RecoveryStrategy::new(5, 2000),
            ErrorCategory::Unknown => RecoveryStrategy::new(0, 0),
        }
    }
}

/// 重试耗尽
#[derive(Debug, Clone)]
pub struct RetryError<E> {
    /// 尝试次数（包括初始执行）
    pub attempts: u32,
    /// 最后一次错误
    pub last_error: E,
}

/// 重试器
#[derive(Debug, Clone)]
pub struct Retrier {
    strategy: RecoveryStrategy,
}

impl Retrier {
    pub fn new(strategy: RecoveryStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &RecoveryStrategy {
        &self.strategy
    }

    /// 带重试执行异步操作
    ///
    /// 每次重试前先等待退避，再调用 `before_retry(retry_index, &last_error)`
    pub async fn execute<F, Fut, T, E, H, HFut>(
        &self,
        mut operation: F,
        mut before_retry: H,
    ) -> Result<(T, u32), RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: FnMut(u32, &E) -> HFut,
        HFut: Future,
    {
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            match operation().await {
                Ok(result) => return Ok((result, attempts)),
                Err(error) => {
                    if attempts > self.strategy.max_retries {
                        return Err(RetryError {
                            attempts,
                            last_error: error,
                        });
                    }

                    let retry_index = attempts - 1;
                    tokio::time::sleep(self.strategy.backoff_delay(retry_index)).await;
                    before_retry(retry_index, &error).await;
                }
            }
        }
    }
}
