//! 健康监控器
//!
//! 定时执行健康检查，维护错误滑动窗口。
//! 窗口内错误数达到阈值时计一次恢复周期、清空窗口，
//! 并对窗口内出现过的类别执行一轮修复。

use super::checks::HealthCheck;
use super::types::{CheckResult, CheckStatus, ErrorRecord, HealthStats};
use crate::config::HealthConfig;
use crate::error::RelayError;
use crate::logger::sanitize_log_message;
use crate::resilience::{ErrorCategory, RecoveryPolicyRegistry, RemediationOutcome};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// 健康检查失败记入错误记录时使用的错误码
pub const HEALTH_CHECK_FAILED: &str = "HEALTH_CHECK_FAILED";

/// 健康监控器
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<RecoveryPolicyRegistry>,
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    active_connections: Arc<AtomicUsize>,
    /// 滑动窗口：(时间, 类别)
    window: Mutex<VecDeque<(Instant, ErrorCategory)>>,
    recent: RwLock<VecDeque<ErrorRecord>>,
    by_category: RwLock<HashMap<ErrorCategory, u64>>,
    last_checks: RwLock<Vec<CheckResult>>,
    total_errors: AtomicU64,
    recovery_cycles: AtomicU64,
    check_runs: AtomicU64,
    started_at: chrono::DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        registry: Arc<RecoveryPolicyRegistry>,
        active_connections: Arc<AtomicUsize>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry,
            checks: RwLock::new(Vec::new()),
            active_connections,
            window: Mutex::new(VecDeque::new()),
            recent: RwLock::new(VecDeque::new()),
            by_category: RwLock::new(HashMap::new()),
            last_checks: RwLock::new(Vec::new()),
            total_errors: AtomicU64::new(0),
            recovery_cycles: AtomicU64::new(0),
            check_runs: AtomicU64::new(0),
            started_at: Utc::now(),
            shutdown_tx,
        }
    }

    /// 注册检查项
    pub fn add_check(&self, check: Arc<dyn HealthCheck>) {
        self.checks.write().push(check);
    }

    /// 记录一次错误
    pub fn record_error(&self, error: &RelayError, context: Option<&str>) -> ErrorRecord {
        let category = self.registry.categorize(error);
        self.record_error_at(
            category,
            error.code(),
            &error.to_string(),
            context,
            Instant::now(),
        )
    }

    /// 以指定时间记录错误
    pub fn record_error_at(
        &self,
        category: ErrorCategory,
        code: &str,
        message: &str,
        context: Option<&str>,
        at: Instant,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            category,
            code: code.to_string(),
            message: sanitize_log_message(message),
            context: context.map(str::to_string),
        };

        self.total_errors.fetch_add(1, Ordering::SeqCst);
        *self.by_category.write().entry(category).or_insert(0) += 1;
        {
            let mut recent = self.recent.write();
            recent.push_back(record.clone());
            while recent.len() > self.config.recent_errors_limit {
                recent.pop_front();
            }
        }

        if let Some(categories) = self.push_window(category, at) {
            self.trigger_recovery(categories);
        }
        record
    }

    /// 写入滑动窗口；达到阈值时清空窗口并返回窗口内出现过的类别
    fn push_window(&self, category: ErrorCategory, at: Instant) -> Option<Vec<ErrorCategory>> {
        let mut window = self.window.lock();
        window.push_back((at, category));

        let horizon = self.config.error_window();
        while let Some((first, _)) = window.front() {
            if at.saturating_duration_since(*first) > horizon {
                window.pop_front();
            } else {
                break;
            }
        }

        if self.config.error_threshold == 0 || window.len() < self.config.error_threshold {
            return None;
        }

        let mut categories: Vec<ErrorCategory> = Vec::new();
        for (_, seen) in window.iter() {
            if !categories.contains(seen) {
                categories.push(*seen);
            }
        }
        window.clear();
        Some(categories)
    }

    fn trigger_recovery(&self, categories: Vec<ErrorCategory>) {
        let cycle = self.recovery_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(
            alert = "error_threshold_exceeded",
            cycle,
            threshold = self.config.error_threshold,
            window_ms = self.config.error_window_ms,
            "[HEALTH] 错误数达到阈值，开始第 {} 轮恢复: {:?}",
            cycle,
            categories
        );

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("[HEALTH] 无 tokio 运行时，跳过修复");
            return;
        };
        let registry = Arc::clone(&self.registry);
        handle.spawn(async move {
            let outcomes = registry.remediate_all(&categories).await;
            let failed = outcomes.iter().filter(|o| !o.success).count();
            tracing::info!(
                "[HEALTH] 恢复完成: {} 个钩子，{} 个失败",
                outcomes.len(),
                failed
            );
        });
    }

    /// 手动恢复；未指定类别时使用最近错误中出现过的类别
    pub async fn recover(&self, categories: Option<Vec<ErrorCategory>>) -> Vec<RemediationOutcome> {
        let categories = categories.unwrap_or_else(|| {
            let mut seen = Vec::new();
            for record in self.recent.read().iter() {
                if !seen.contains(&record.category) {
                    seen.push(record.category);
                }
            }
            seen
        });
        self.recovery_cycles.fetch_add(1, Ordering::SeqCst);
        tracing::info!("[HEALTH] 手动恢复: {:?}", categories);
        self.registry.remediate_all(&categories).await
    }

    /// 执行一轮检查，各项独立超时
    pub async fn run_checks(&self) -> Vec<CheckResult> {
        let checks: Vec<Arc<dyn HealthCheck>> = self.checks.read().clone();
        let timeout = self.config.check_timeout();

        let outcomes = futures::future::join_all(checks.into_iter().map(|check| async move {
            let started = Instant::now();
            let mut result = match tokio::time::timeout(timeout, check.check()).await {
                Ok(result) => result,
                Err(_) => CheckResult::unhealthy(
                    check.name(),
                    format!("timed out after {}ms", timeout.as_millis()),
                ),
            };
            result.duration_ms = started.elapsed().as_millis() as u64;
            (check.category(), result)
        }))
        .await;

        let failing = outcomes
            .iter()
            .filter(|(_, r)| r.status != CheckStatus::Healthy);
        for (category, result) in failing {
            tracing::warn!(
                "[HEALTH] 检查 {} 状态 {}: {}",
                result.name,
                result.status,
                result.detail
            );
            if result.status == CheckStatus::Unhealthy {
                self.record_error_at(
                    *category,
                    HEALTH_CHECK_FAILED,
                    &result.detail,
                    Some(result.name.as_str()),
                    Instant::now(),
                );
            }
        }
        let results: Vec<CheckResult> = outcomes.into_iter().map(|(_, result)| result).collect();

        self.check_runs.fetch_add(1, Ordering::SeqCst);
        *self.last_checks.write() = results.clone();
        results
    }

    /// 启动定时检查循环
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.check_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                "[HEALTH] 监控已启动，间隔 {}ms",
                monitor.config.check_interval_ms
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        monitor.run_checks().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("[HEALTH] 监控已停止");
        })
    }

    /// 停止定时检查
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn recovery_cycles(&self) -> u64 {
        self.recovery_cycles.load(Ordering::SeqCst)
    }

    pub fn window_len(&self) -> usize {
        self.window.lock().len()
    }

    /// 最近的错误，新的在前
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.recent.read().iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> HealthStats {
        let last_checks = self.last_checks.read().clone();
        let status = last_checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Healthy);
        let now = Utc::now();
        HealthStats {
            status,
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            total_errors: self.total_errors.load(Ordering::SeqCst),
            errors_by_category: self.by_category.read().clone(),
            window_errors: self.window_len(),
            error_threshold: self.config.error_threshold,
            recovery_cycles: self.recovery_cycles(),
            check_runs: self.check_runs.load(Ordering::SeqCst),
            active_connections: self.active_connections.load(Ordering::SeqCst),
            last_checks,
        }
    }

    /// 清空计数与记录（检查项保留）
    pub fn reset(&self) {
        self.window.lock().clear();
        self.recent.write().clear();
        self.by_category.write().clear();
        self.last_checks.write().clear();
        self.total_errors.store(0, Ordering::SeqCst);
        self.recovery_cycles.store(0, Ordering::SeqCst);
        self.check_runs.store(0, Ordering::SeqCst);
        tracing::info!("[HEALTH] 统计已重置");
    }
}
