//! 容错机制模块
//!
//! 提供错误分类、按类别的退避重试、修复钩子和超时控制

mod category;
mod hooks;
mod registry;
mod retry;
mod timeout;

pub use category::{
    ErrorCategory, AUTH_KEYWORDS, NETWORK_KEYWORDS, PROTOCOL_KEYWORDS, SESSION_KEYWORDS,
};
pub use hooks::{
    BridgeRestartHook, CredentialRefreshHook, ReachabilityProbeHook, RemediationHook,
    RemediationOutcome,
};
pub use registry::{RecoveryPolicyRegistry, RecoveryResult};
pub use retry::{RecoveryStrategy, Retrier, RetryError};
pub use timeout::{TimeoutController, TimeoutError};

#[cfg(test)]
mod tests;
