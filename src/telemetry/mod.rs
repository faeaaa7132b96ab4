//! 健康监控模块
//!
//! 提供定时健康检查、错误滑动窗口和阈值触发的恢复周期

mod checks;
mod monitor;
mod types;

pub use checks::{
    parse_vm_rss_kb, ConnectionCheck, CredentialCheck, HealthCheck, MemoryCheck,
    ReachabilityCheck,
};
pub use monitor::{HealthMonitor, HEALTH_CHECK_FAILED};
pub use types::{CheckResult, CheckStatus, ErrorRecord, HealthStats};

#[cfg(test)]
mod tests;
