//! 容错机制属性测试
//!
//! 使用 proptest 进行属性测试，退避时序用暂停的 tokio 时钟验证

use crate::error::RelayError;
use crate::resilience::{
    ErrorCategory, RecoveryPolicyRegistry, RecoveryStrategy, RemediationHook, RemediationOutcome,
    Retrier,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 记录调用序号的修复钩子
#[derive(Default)]
struct RecordingHook {
    calls: Mutex<Vec<u32>>,
}

#[async_trait]
impl RemediationHook for RecordingHook {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn remediate(&self, attempt: u32) -> RemediationOutcome {
        self.calls.lock().push(attempt);
        RemediationOutcome::ok(self.name(), "noop")
    }
}

fn arb_strategy() -> impl Strategy<Value = RecoveryStrategy> {
    (0u32..=5u32, 0u64..=3u64)
        .prop_map(|(max_retries, base)| RecoveryStrategy::new(max_retries, base))
}

fn current_thread_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    /// 持续失败的操作总共执行 1 + max_retries 次
    #[test]
    fn prop_retry_count_limit(strategy in arb_strategy()) {
        let retrier = Retrier::new(strategy);
        let rt = current_thread_runtime();

        let (result, calls) = rt.block_on(async {
            let calls = Arc::new(AtomicU32::new(0));
            let counter = calls.clone();
            let result = retrier
                .execute(
                    || {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>("upstream closed".to_string())
                        }
                    },
                    |_, _| async {},
                )
                .await;
            (result, calls.load(Ordering::SeqCst))
        });

        let err = result.unwrap_err();
        prop_assert_eq!(calls, 1 + strategy.max_retries);
        prop_assert_eq!(err.attempts, 1 + strategy.max_retries);
        prop_assert_eq!(err.last_error, "upstream closed".to_string());
    }

    /// 第 k 次执行成功后立即停止重试
    #[test]
    fn prop_retry_stops_on_success(
        max_retries in 1u32..=5u32,
        success_on in 1u32..=6u32,
    ) {
        let retrier = Retrier::new(RecoveryStrategy::new(max_retries, 0));
        let rt = current_thread_runtime();

        let (result, calls) = rt.block_on(async {
            let calls = Arc::new(AtomicU32::new(0));
            let counter = calls.clone();
            let result = retrier
                .execute(
                    || {
                        let counter = counter.clone();
                        async move {
                            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                            if n >= success_on { Ok(n) } else { Err("retry me") }
                        }
                    },
                    |_, _| async {},
                )
                .await;
            (result, calls.load(Ordering::SeqCst))
        });

        if success_on <= max_retries + 1 {
            let (value, attempts) = result.unwrap();
            prop_assert_eq!(value, success_on);
            prop_assert_eq!(attempts, success_on);
            prop_assert_eq!(calls, success_on);
        } else {
            prop_assert!(result.is_err());
            prop_assert_eq!(calls, max_retries + 1);
        }
    }

    /// 退避序列严格按 2 倍增长
    #[test]
    fn prop_backoff_doubles(max_retries in 1u32..=8u32, base in 1u64..=5000u64) {
        let strategy = RecoveryStrategy::new(max_retries, base);
        let sequence = strategy.compute_backoff_sequence();
        prop_assert_eq!(sequence.len(), max_retries as usize);
        for (n, delay) in sequence.iter().enumerate() {
            prop_assert_eq!(*delay, Duration::from_millis(base * (1u64 << n)));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_registry_backoff_timing_and_hooks() {
    let registry = RecoveryPolicyRegistry::with_defaults();
    registry.set_strategy(
        ErrorCategory::UpstreamProtocol,
        RecoveryStrategy::new(3, 1000),
    );
    let hook = Arc::new(RecordingHook::default());
    registry.register_hook(ErrorCategory::UpstreamProtocol, hook.clone());

    let started = Instant::now();
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let stamps_op = stamps.clone();

    let result = registry
        .retry(ErrorCategory::UpstreamProtocol, || {
            let stamps = stamps_op.clone();
            async move {
                stamps.lock().push(started.elapsed());
                Err::<(), _>(RelayError::protocol("Unknown name \"turns\""))
            }
        })
        .await;

    assert!(!result.success);
    assert_eq!(result.attempts, 4);
    assert_eq!(result.strategy_used, ErrorCategory::UpstreamProtocol);
    assert!(matches!(
        result.result,
        Err(RelayError::UpstreamProtocol { .. })
    ));

    let stamps = stamps.lock().clone();
    assert_eq!(stamps.len(), 4);
    let gaps: Vec<u128> = stamps
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis())
        .collect();
    assert_eq!(gaps, vec![1000, 2000, 4000]);

    assert_eq!(*hook.calls.lock(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_registry_retry_recovers() {
    let registry = RecoveryPolicyRegistry::with_defaults();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = registry
        .retry(ErrorCategory::UpstreamNetwork, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RelayError::UpstreamTransport("connection reset".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

    assert!(result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.into_result().unwrap(), "ok");
}

#[tokio::test(start_paused = true)]
async fn test_retry_classified_uses_failure_category() {
    let registry = RecoveryPolicyRegistry::with_defaults();
    let hook = Arc::new(RecordingHook::default());
    registry.register_hook(ErrorCategory::UpstreamAuth, hook.clone());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = registry
        .retry_classified(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RelayError::Credential("token expired".into()))
            }
        })
        .await;

    assert!(!result.success);
    assert_eq!(result.strategy_used, ErrorCategory::UpstreamAuth);
    // AUTH 默认 {1, 0}：首次 + 1 次重试
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*hook.calls.lock(), vec![0]);
}

#[tokio::test]
async fn test_zero_retry_strategy_runs_once() {
    let registry = RecoveryPolicyRegistry::with_defaults();
    registry.set_strategy(ErrorCategory::UpstreamProtocol, RecoveryStrategy::new(0, 0));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result = registry
        .retry_classified(|| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RelayError::protocol_with_status(418, "teapot"))
            }
        })
        .await;

    assert_eq!(result.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remediate_all_skips_missing_hooks() {
    let registry = RecoveryPolicyRegistry::with_defaults();
    let hook = Arc::new(RecordingHook::default());
    registry.register_hook(ErrorCategory::SessionError, hook.clone());

    let outcomes = registry
        .remediate_all(&[ErrorCategory::UpstreamAuth, ErrorCategory::SessionError])
        .await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].hook, "recording");
    assert!(outcomes[0].success);
}
