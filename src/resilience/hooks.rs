//! 修复钩子
//!
//! 每个错误类别在重试前可执行一个修复动作：
//! 认证类重新获取凭证，网络类探测可达性，会话类重启子进程桥接

use crate::bridge::LiveBridge;
use crate::providers::TokenSource;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// 修复结果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RemediationOutcome {
    pub hook: String,
    pub success: bool,
    pub detail: String,
}

impl RemediationOutcome {
    pub fn ok(hook: &str, detail: impl Into<String>) -> Self {
        Self {
            hook: hook.to_string(),
            success: true,
            detail: detail.into(),
        }
    }

    pub fn failed(hook: &str, detail: impl Into<String>) -> Self {
        Self {
            hook: hook.to_string(),
            success: false,
            detail: detail.into(),
        }
    }
}

/// 修复钩子 Trait
#[async_trait]
pub trait RemediationHook: Send + Sync {
    fn name(&self) -> &'static str;

    /// 执行修复，`attempt` 为当前重试序号（从 0 开始）
    async fn remediate(&self, attempt: u32) -> RemediationOutcome;
}

/// 重新获取上游凭证
pub struct CredentialRefreshHook {
    source: Arc<dyn TokenSource>,
}

impl CredentialRefreshHook {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl RemediationHook for CredentialRefreshHook {
    fn name(&self) -> &'static str {
        "credential_refresh"
    }

    async fn remediate(&self, attempt: u32) -> RemediationOutcome {
        self.source.invalidate();
        match self.source.credential().await {
            Ok(credential) => {
                tracing::info!(
                    "[RECOVERY] 凭证已重新获取: source={}, mode={}, attempt={}",
                    self.source.source_name(),
                    credential.mode(),
                    attempt
                );
                RemediationOutcome::ok(self.name(), credential.mode())
            }
            Err(e) => RemediationOutcome::failed(self.name(), e.to_string()),
        }
    }
}

/// 探测上游可达性
pub struct ReachabilityProbeHook {
    client: Client,
    url: String,
    timeout: Duration,
}

impl ReachabilityProbeHook {
    pub fn new(client: Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    /// 发起一次 GET 探测；只要收到 HTTP 响应即视为可达
    pub async fn probe(&self) -> Result<u16, String> {
        self.client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map(|resp| resp.status().as_u16())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl RemediationHook for ReachabilityProbeHook {
    fn name(&self) -> &'static str {
        "reachability_probe"
    }

    async fn remediate(&self, _attempt: u32) -> RemediationOutcome {
        match self.probe().await {
            Ok(status) => RemediationOutcome::ok(self.name(), format!("HTTP {}", status)),
            Err(e) => {
                tracing::warn!("[RECOVERY] 上游不可达: {}", e);
                RemediationOutcome::failed(self.name(), e)
            }
        }
    }
}

/// 重启子进程桥接
///
/// 只安排一次延迟重启后立即返回，不在客户端轮次里等待进程就绪
pub struct BridgeRestartHook {
    bridge: Arc<LiveBridge>,
}

impl BridgeRestartHook {
    pub fn new(bridge: Arc<LiveBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl RemediationHook for BridgeRestartHook {
    fn name(&self) -> &'static str {
        "bridge_restart"
    }

    async fn remediate(&self, _attempt: u32) -> RemediationOutcome {
        if !self.bridge.is_enabled() {
            return RemediationOutcome::ok(self.name(), "bridge disabled");
        }
        if self.bridge.is_running() {
            return RemediationOutcome::ok(self.name(), "bridge running");
        }
        if self.bridge.schedule_restart() {
            tracing::info!(
                "[RECOVERY] 已安排 {}ms 后重启辅助进程",
                self.bridge.restart_delay().as_millis()
            );
            RemediationOutcome::ok(self.name(), "restart scheduled")
        } else {
            RemediationOutcome::ok(self.name(), "restart already scheduled")
        }
    }
}
