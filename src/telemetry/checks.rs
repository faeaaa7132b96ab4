//! 健康检查项
//!
//! 每项检查相互独立，由监控器各自加超时并行执行

use super::types::CheckResult;
use crate::providers::TokenSource;
use crate::resilience::{ErrorCategory, ReachabilityProbeHook};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 健康检查 Trait
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// 检查失败时记入监控的错误类别
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Unknown
    }

    async fn check(&self) -> CheckResult;
}

/// 凭证探测
pub struct CredentialCheck {
    source: Arc<dyn TokenSource>,
}

impl CredentialCheck {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl HealthCheck for CredentialCheck {
    fn name(&self) -> &'static str {
        "credential"
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::UpstreamAuth
    }

    async fn check(&self) -> CheckResult {
        match self.source.credential().await {
            Ok(credential) => CheckResult::healthy(
                self.name(),
                format!("{} via {}", credential.mode(), self.source.source_name()),
            ),
            Err(e) => CheckResult::unhealthy(self.name(), e.to_string()),
        }
    }
}

/// 上游可达性
pub struct ReachabilityCheck {
    probe: Arc<ReachabilityProbeHook>,
}

impl ReachabilityCheck {
    pub fn new(probe: Arc<ReachabilityProbeHook>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl HealthCheck for ReachabilityCheck {
    fn name(&self) -> &'static str {
        "reachability"
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::UpstreamNetwork
    }

    async fn check(&self) -> CheckResult {
        match self.probe.probe().await {
            Ok(status) if status >= 500 => {
                CheckResult::degraded(self.name(), format!("HTTP {}", status))
            }
            Ok(status) => CheckResult::healthy(self.name(), format!("HTTP {}", status)),
            Err(e) => CheckResult::unhealthy(self.name(), e),
        }
    }
}

/// 活跃连接数是否在合理范围
pub struct ConnectionCheck {
    active: Arc<AtomicUsize>,
    max_active: usize,
}

impl ConnectionCheck {
    pub fn new(active: Arc<AtomicUsize>, max_active: usize) -> Self {
        Self { active, max_active }
    }
}

#[async_trait]
impl HealthCheck for ConnectionCheck {
    fn name(&self) -> &'static str {
        "connections"
    }

    async fn check(&self) -> CheckResult {
        let active = self.active.load(Ordering::SeqCst);
        let detail = format!("{} active / {} max", active, self.max_active);
        if active > self.max_active {
            CheckResult::degraded(self.name(), detail)
        } else {
            CheckResult::healthy(self.name(), detail)
        }
    }
}

/// 常驻内存上限
pub struct MemoryCheck {
    ceiling_mb: u64,
}

impl MemoryCheck {
    pub fn new(ceiling_mb: u64) -> Self {
        Self { ceiling_mb }
    }
}

/// 从 `/proc/self/status` 的 VmRSS 行解析常驻内存（KB）
pub fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

#[async_trait]
impl HealthCheck for MemoryCheck {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check(&self) -> CheckResult {
        let status = match tokio::fs::read_to_string("/proc/self/status").await {
            Ok(status) => status,
            Err(_) => return CheckResult::healthy(self.name(), "rss unavailable on this platform"),
        };
        let Some(rss_kb) = parse_vm_rss_kb(&status) else {
            return CheckResult::healthy(self.name(), "rss unavailable");
        };
        let rss_mb = rss_kb / 1024;
        let detail = format!("rss {}MB / ceiling {}MB", rss_mb, self.ceiling_mb);
        if rss_mb > self.ceiling_mb {
            CheckResult::unhealthy(self.name(), detail)
        } else {
            CheckResult::healthy(self.name(), detail)
        }
    }
}
