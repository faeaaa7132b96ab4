//! 恢复策略注册表
//!
//! 请求路径、健康监控和手动恢复共用同一套分类、重试与修复入口

use super::category::ErrorCategory;
use super::hooks::{RemediationHook, RemediationOutcome};
use super::retry::{RecoveryStrategy, Retrier};
use crate::config::RecoveryConfig;
use crate::error::RelayError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// 带恢复执行的结果
#[derive(Debug)]
pub struct RecoveryResult<T> {
    pub success: bool,
    pub result: Result<T, RelayError>,
    /// 实际使用的策略类别
    pub strategy_used: ErrorCategory,
    /// 总执行次数（含首次）
    pub attempts: u32,
}

impl<T> RecoveryResult<T> {
    pub fn into_result(self) -> Result<T, RelayError> {
        self.result
    }
}

/// 恢复策略注册表
pub struct RecoveryPolicyRegistry {
    strategies: RwLock<HashMap<ErrorCategory, RecoveryStrategy>>,
    hooks: RwLock<HashMap<ErrorCategory, Arc<dyn RemediationHook>>>,
}

impl RecoveryPolicyRegistry {
    pub fn new(config: &RecoveryConfig) -> Self {
        let strategies = ErrorCategory::ALL
            .iter()
            .map(|category| (*category, *config.strategy_for(*category)))
            .collect();
        Self {
            strategies: RwLock::new(strategies),
            hooks: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&RecoveryConfig::default())
    }

    /// 注册某类别的修复钩子（覆盖已有）
    pub fn register_hook(&self, category: ErrorCategory, hook: Arc<dyn RemediationHook>) {
        self.hooks.write().insert(category, hook);
    }

    pub fn set_strategy(&self, category: ErrorCategory, strategy: RecoveryStrategy) {
        self.strategies.write().insert(category, strategy);
    }

    pub fn strategy(&self, category: ErrorCategory) -> RecoveryStrategy {
        self.strategies
            .read()
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_strategy())
    }

    pub fn categorize(&self, error: &RelayError) -> ErrorCategory {
        ErrorCategory::categorize(error)
    }

    fn hook(&self, category: ErrorCategory) -> Option<Arc<dyn RemediationHook>> {
        self.hooks.read().get(&category).cloned()
    }

    /// 执行某类别的修复钩子；未注册钩子时返回 None
    pub async fn remediate(
        &self,
        category: ErrorCategory,
        attempt: u32,
    ) -> Option<RemediationOutcome> {
        let hook = self.hook(category)?;
        let outcome = hook.remediate(attempt).await;
        tracing::info!(
            "[RECOVERY] 修复钩子 {} ({}): success={}, detail={}",
            outcome.hook,
            category,
            outcome.success,
            outcome.detail
        );
        Some(outcome)
    }

    /// 对一组类别依次执行修复（健康监控与手动恢复使用）
    pub async fn remediate_all(&self, categories: &[ErrorCategory]) -> Vec<RemediationOutcome> {
        let mut outcomes = Vec::new();
        for category in categories {
            if let Some(outcome) = self.remediate(*category, 0).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// 请求路径上的失败：分类并执行一次修复，返回类别
    pub async fn route_failure(&self, error: &RelayError) -> ErrorCategory {
        let category = self.categorize(error);
        tracing::debug!("[RECOVERY] 失败归类为 {}: {}", category, error);
        self.remediate(category, 0).await;
        category
    }

    /// 按指定类别的策略带重试执行
    pub async fn retry<F, Fut, T>(&self, category: ErrorCategory, operation: F) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let retrier = Retrier::new(self.strategy(category));
        let outcome = retrier
            .execute(operation, |retry_index, error| {
                tracing::warn!(
                    "[RECOVERY] {} 第 {} 次重试: {}",
                    category,
                    retry_index + 1,
                    error
                );
                self.remediate(category, retry_index)
            })
            .await;

        match outcome {
            Ok((value, attempts)) => RecoveryResult {
                success: true,
                result: Ok(value),
                strategy_used: category,
                attempts,
            },
            Err(err) => RecoveryResult {
                success: false,
                result: Err(err.last_error),
                strategy_used: category,
                attempts: err.attempts,
            },
        }
    }

    /// 按首次失败的类别选择策略带重试执行
    ///
    /// 之后每次失败都重新归类，次数上限取当前类别的策略
    pub async fn retry_classified<F, Fut, T>(&self, mut operation: F) -> RecoveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        let mut attempts = 0u32;
        let mut last_category = ErrorCategory::Unknown;
        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    return RecoveryResult {
                        success: true,
                        result: Ok(value),
                        strategy_used: last_category,
                        attempts,
                    }
                }
                Err(error) => {
                    let category = self.categorize(&error);
                    last_category = category;
                    let strategy = self.strategy(category);
                    if attempts > strategy.max_retries {
                        return RecoveryResult {
                            success: false,
                            result: Err(error),
                            strategy_used: category,
                            attempts,
                        };
                    }
                    let retry_index = attempts - 1;
                    tracing::warn!(
                        "[RECOVERY] {} 第 {} 次重试: {}",
                        category,
                        attempts,
                        error
                    );
                    tokio::time::sleep(strategy.backoff_delay(retry_index)).await;
                    self.remediate(category, retry_index).await;
                }
            }
        }
    }
}

impl Default for RecoveryPolicyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
