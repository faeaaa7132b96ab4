//! 健康监控测试
//!
//! 滑动窗口与阈值用显式时间点验证，检查隔离用暂停的 tokio 时钟验证

use crate::config::HealthConfig;
use crate::error::RelayError;
use crate::resilience::{ErrorCategory, RecoveryPolicyRegistry, RemediationHook, RemediationOutcome};
use crate::telemetry::{
    parse_vm_rss_kb, CheckResult, CheckStatus, ConnectionCheck, HealthCheck, HealthMonitor,
    HEALTH_CHECK_FAILED,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct CountingHook {
    calls: Mutex<u32>,
}

#[async_trait]
impl RemediationHook for CountingHook {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn remediate(&self, _attempt: u32) -> RemediationOutcome {
        *self.calls.lock() += 1;
        RemediationOutcome::ok(self.name(), "noop")
    }
}

struct FixedCheck(&'static str, CheckStatus);

#[async_trait]
impl HealthCheck for FixedCheck {
    fn name(&self) -> &'static str {
        self.0
    }

    async fn check(&self) -> CheckResult {
        CheckResult::new(self.0, self.1, "fixed")
    }
}

#[derive(Default)]
struct CountingCheck {
    runs: AtomicUsize,
}

#[async_trait]
impl HealthCheck for CountingCheck {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn check(&self) -> CheckResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        CheckResult::healthy("counting", "ok")
    }
}

struct StuckCheck;

#[async_trait]
impl HealthCheck for StuckCheck {
    fn name(&self) -> &'static str {
        "stuck"
    }

    async fn check(&self) -> CheckResult {
        std::future::pending::<()>().await;
        CheckResult::healthy("stuck", "unreachable")
    }
}

fn monitor_with(config: HealthConfig) -> (HealthMonitor, Arc<RecoveryPolicyRegistry>) {
    let registry = Arc::new(RecoveryPolicyRegistry::with_defaults());
    let monitor = HealthMonitor::new(config, registry.clone(), Arc::new(AtomicUsize::new(0)));
    (monitor, registry)
}

fn record(monitor: &HealthMonitor, at: Instant) {
    monitor.record_error_at(
        ErrorCategory::UpstreamNetwork,
        "UPSTREAM_TRANSPORT_ERROR",
        "connection reset",
        None,
        at,
    );
}

#[tokio::test]
async fn test_threshold_triggers_exactly_one_cycle() {
    let (monitor, registry) = monitor_with(HealthConfig::default());
    let hook = Arc::new(CountingHook::default());
    registry.register_hook(ErrorCategory::UpstreamNetwork, hook.clone());

    let base = Instant::now();
    for i in 0..10 {
        record(&monitor, base + Duration::from_secs(i));
    }
    assert_eq!(monitor.recovery_cycles(), 1);
    assert_eq!(monitor.window_len(), 0);

    // 窗口已清空，再来 9 条不会触发
    for i in 10..19 {
        record(&monitor, base + Duration::from_secs(i));
    }
    assert_eq!(monitor.recovery_cycles(), 1);
    assert_eq!(monitor.window_len(), 9);

    // 修复任务在后台执行
    for _ in 0..50 {
        if *hook.calls.lock() == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(*hook.calls.lock(), 1);
}

#[tokio::test]
async fn test_records_outside_window_do_not_count() {
    let (monitor, _) = monitor_with(HealthConfig::default());
    let base = Instant::now();

    for i in 0..5 {
        record(&monitor, base + Duration::from_secs(i));
    }
    // 61 秒后前 5 条已滑出窗口
    for i in 0..9 {
        record(&monitor, base + Duration::from_secs(70 + i));
    }
    assert_eq!(monitor.recovery_cycles(), 0);
    assert_eq!(monitor.window_len(), 9);
    assert_eq!(monitor.stats().total_errors, 14);
}

#[tokio::test]
async fn test_record_error_sanitizes_and_categorizes() {
    let (monitor, _) = monitor_with(HealthConfig::default());
    let err = RelayError::UpstreamTransport(
        "GET https://host/ws?key=AIzaSecret123 failed".to_string(),
    );
    let record = monitor.record_error(&err, Some("direct"));

    assert_eq!(record.category, ErrorCategory::UpstreamNetwork);
    assert_eq!(record.code, "UPSTREAM_TRANSPORT_ERROR");
    assert!(!record.message.contains("AIzaSecret123"));
    assert_eq!(record.context.as_deref(), Some("direct"));

    let stats = monitor.stats();
    assert_eq!(stats.errors_by_category[&ErrorCategory::UpstreamNetwork], 1);
}

#[tokio::test]
async fn test_recent_errors_newest_first_and_bounded() {
    let (monitor, _) = monitor_with(HealthConfig {
        recent_errors_limit: 3,
        error_threshold: 0,
        ..Default::default()
    });
    let base = Instant::now();
    for i in 0..5 {
        monitor.record_error_at(
            ErrorCategory::Unknown,
            "X",
            &format!("error {}", i),
            None,
            base,
        );
    }

    let recent = monitor.recent_errors(10);
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].message, "error 4");
    assert_eq!(recent[2].message, "error 2");
    assert_eq!(monitor.recent_errors(1).len(), 1);
    assert_eq!(monitor.recovery_cycles(), 0);
}

#[tokio::test]
async fn test_reset_clears_counters() {
    let (monitor, _) = monitor_with(HealthConfig::default());
    let base = Instant::now();
    for i in 0..12 {
        record(&monitor, base + Duration::from_millis(i));
    }
    monitor.reset();

    let stats = monitor.stats();
    assert_eq!(stats.total_errors, 0);
    assert_eq!(stats.recovery_cycles, 0);
    assert!(stats.errors_by_category.is_empty());
    assert!(monitor.recent_errors(10).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_checks_are_isolated() {
    let (monitor, _) = monitor_with(HealthConfig {
        check_timeout_ms: 100,
        ..Default::default()
    });
    monitor.add_check(Arc::new(FixedCheck("ok", CheckStatus::Healthy)));
    monitor.add_check(Arc::new(StuckCheck));
    monitor.add_check(Arc::new(FixedCheck("bad", CheckStatus::Unhealthy)));

    let results = monitor.run_checks().await;
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].status, CheckStatus::Healthy);
    assert_eq!(results[1].status, CheckStatus::Unhealthy);
    assert!(results[1].detail.contains("timed out"));
    assert_eq!(results[2].status, CheckStatus::Unhealthy);

    let stats = monitor.stats();
    assert_eq!(stats.check_runs, 1);
    assert_eq!(stats.status, CheckStatus::Unhealthy);
}

#[tokio::test]
async fn test_unhealthy_checks_are_recorded_as_errors() {
    let (monitor, _) = monitor_with(HealthConfig::default());
    monitor.add_check(Arc::new(FixedCheck("ok", CheckStatus::Healthy)));
    monitor.add_check(Arc::new(FixedCheck("slow", CheckStatus::Degraded)));
    monitor.add_check(Arc::new(FixedCheck("bad", CheckStatus::Unhealthy)));

    monitor.run_checks().await;

    let recent = monitor.recent_errors(10);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].code, HEALTH_CHECK_FAILED);
    assert_eq!(recent[0].context.as_deref(), Some("bad"));
    assert_eq!(recent[0].category, ErrorCategory::Unknown);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_loop_runs_until_shutdown() {
    let monitor = Arc::new(
        monitor_with(HealthConfig {
            check_interval_ms: 100,
            ..Default::default()
        })
        .0,
    );
    let check = Arc::new(CountingCheck::default());
    monitor.add_check(check.clone());

    let handle = monitor.spawn();
    tokio::time::sleep(Duration::from_millis(350)).await;
    let runs = check.runs.load(Ordering::SeqCst);
    assert!(runs >= 3, "expected at least 3 runs, got {}", runs);
    assert!(monitor.stats().check_runs >= 3);

    monitor.shutdown();
    handle.await.unwrap();
    let stopped_at = check.runs.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(check.runs.load(Ordering::SeqCst), stopped_at);
}

#[tokio::test]
async fn test_manual_recover_uses_seen_categories() {
    let (monitor, registry) = monitor_with(HealthConfig::default());
    let hook = Arc::new(CountingHook::default());
    registry.register_hook(ErrorCategory::UpstreamAuth, hook.clone());

    monitor.record_error(&RelayError::Credential("expired".into()), None);
    let outcomes = monitor.recover(None).await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(*hook.calls.lock(), 1);
    assert_eq!(monitor.recovery_cycles(), 1);
}

#[tokio::test]
async fn test_connection_check_and_rss_parse() {
    let active = Arc::new(AtomicUsize::new(5));
    let check = ConnectionCheck::new(active.clone(), 4);
    assert_eq!(check.check().await.status, CheckStatus::Degraded);

    let status = "Name:\tlivecast\nVmRSS:\t  204800 kB\nThreads:\t8\n";
    assert_eq!(parse_vm_rss_kb(status), Some(204800));
    assert_eq!(parse_vm_rss_kb("Name: x"), None);
}

proptest! {
    /// 任意错误序列下，恢复周期数不超过 错误数 / 阈值
    #[test]
    fn prop_cycles_bounded_by_threshold(gaps in proptest::collection::vec(0u64..30_000, 1..60)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (monitor, _) = monitor_with(HealthConfig::default());
            let mut at = Instant::now();
            for gap in &gaps {
                at += Duration::from_millis(*gap);
                record(&monitor, at);
            }
            let cycles = monitor.recovery_cycles() as usize;
            assert!(cycles <= gaps.len() / 10);
            assert!(monitor.window_len() < 10);
        });
    }
}
