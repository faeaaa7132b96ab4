//! 上游编排
//!
//! 按固定优先级尝试上游策略：子进程桥接（就绪时）→ 直连 Live（带格式协商）
//! → SDK 流式回退。每次失败都先记入健康监控并交给恢复策略表
//! 分类与修复，再推进到下一个策略。首个成功的策略结束本轮。

mod strategies;

pub use strategies::{negotiation_error, BridgeStrategy, DirectLiveStrategy, SdkFallbackStrategy};

use crate::error::RelayError;
use crate::models::GenerationRequest;
use crate::resilience::{ErrorCategory, RecoveryPolicyRegistry};
use crate::telemetry::HealthMonitor;
use crate::translator::TurnRelay;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// 上游策略
#[async_trait]
pub trait UpstreamStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// 当前是否可用；不可用时直接跳过，不计失败
    fn is_available(&self) -> bool {
        true
    }

    /// 执行一轮；成功时 `relay` 已经或即将交付聚合消息
    async fn run(&self, request: &GenerationRequest, relay: &mut TurnRelay) -> Result<(), RelayError>;
}

/// 失败路由：记入健康监控，再分类并执行一次修复
#[derive(Clone)]
pub struct FailureRouter {
    registry: Arc<RecoveryPolicyRegistry>,
    monitor: Arc<HealthMonitor>,
}

impl FailureRouter {
    pub fn new(registry: Arc<RecoveryPolicyRegistry>, monitor: Arc<HealthMonitor>) -> Self {
        Self { registry, monitor }
    }

    pub fn registry(&self) -> &Arc<RecoveryPolicyRegistry> {
        &self.registry
    }

    pub async fn route(&self, error: &RelayError, context: &str) -> ErrorCategory {
        self.monitor.record_error(error, Some(context));
        self.registry.route_failure(error).await
    }
}

/// 每个策略的结果计数
#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyCounters {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// 上游编排器
pub struct UpstreamOrchestrator {
    strategies: Vec<Arc<dyn UpstreamStrategy>>,
    router: FailureRouter,
    counters: RwLock<HashMap<&'static str, StrategyCounters>>,
}

impl UpstreamOrchestrator {
    pub fn new(strategies: Vec<Arc<dyn UpstreamStrategy>>, router: FailureRouter) -> Self {
        Self {
            strategies,
            router,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn counters(&self) -> HashMap<&'static str, StrategyCounters> {
        self.counters.read().clone()
    }

    fn count(&self, name: &'static str, update: impl FnOnce(&mut StrategyCounters)) {
        update(self.counters.write().entry(name).or_default());
    }

    /// 处理一个生成请求，返回成功的策略名
    pub async fn run(
        &self,
        request: &GenerationRequest,
        relay: &mut TurnRelay,
    ) -> Result<&'static str, RelayError> {
        let mut last_error: Option<RelayError> = None;

        for strategy in &self.strategies {
            let name = strategy.name();
            if !strategy.is_available() {
                tracing::debug!("[ORCHESTRATOR] 策略 {} 不可用，跳过", name);
                self.count(name, |c| c.skipped += 1);
                continue;
            }

            tracing::info!(
                "[ORCHESTRATOR] 请求 {} 尝试策略 {} (model={})",
                request.id,
                name,
                request.model
            );
            relay.begin_attempt();

            match strategy.run(request, relay).await {
                Ok(()) => {
                    if !relay.is_delivered() {
                        relay.complete(None);
                    }
                    self.count(name, |c| c.succeeded += 1);
                    tracing::info!("[ORCHESTRATOR] 请求 {} 由 {} 完成", request.id, name);
                    return Ok(name);
                }
                Err(error) => {
                    self.count(name, |c| c.failed += 1);
                    let category = self.router.route(&error, name).await;
                    tracing::warn!(
                        "[ORCHESTRATOR] 策略 {} 失败 ({}): {}",
                        name,
                        category,
                        error
                    );
                    last_error = Some(error);
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| RelayError::protocol("no upstream strategy was available"));
        tracing::error!(
            "[ORCHESTRATOR] 请求 {} 所有策略均失败: {}",
            request.id,
            last
        );
        Err(RelayError::StrategyExhausted {
            last: Box::new(last),
        })
    }
}
