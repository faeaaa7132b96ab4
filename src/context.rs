//! 运行时上下文
//!
//! 启动时一次性构建所有服务并以 `Arc` 注入，不使用全局单例。

use crate::bridge::LiveBridge;
use crate::config::{ConfigError, RelayConfig};
use crate::error::RelayError;
use crate::negotiator::{FormatContext, FormatNegotiator};
use crate::orchestrator::{
    BridgeStrategy, DirectLiveStrategy, FailureRouter, SdkFallbackStrategy, UpstreamOrchestrator,
    UpstreamStrategy,
};
use crate::providers::{build_token_source, DirectLiveTransport, SdkFallbackClient, TokenSource};
use crate::resilience::{
    BridgeRestartHook, CredentialRefreshHook, ErrorCategory, ReachabilityProbeHook,
    RecoveryPolicyRegistry,
};
use crate::telemetry::{
    ConnectionCheck, CredentialCheck, HealthMonitor, MemoryCheck, ReachabilityCheck,
};
use crate::websocket::ConnectionGuard;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// 中继运行时上下文
pub struct RelayContext {
    pub config: RelayConfig,
    pub registry: Arc<RecoveryPolicyRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub bridge: Arc<LiveBridge>,
    pub orchestrator: Arc<UpstreamOrchestrator>,
    pub guard: Arc<ConnectionGuard>,
    pub token_source: Arc<dyn TokenSource>,
}

impl RelayContext {
    pub fn build(config: RelayConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP 客户端初始化失败: {}", e)))?;
        let active_connections = Arc::new(AtomicUsize::new(0));

        let token_source = build_token_source(&config.upstream);
        let registry = Arc::new(RecoveryPolicyRegistry::new(&config.recovery));
        let bridge = Arc::new(LiveBridge::new(config.bridge.clone()));
        let probe = Arc::new(ReachabilityProbeHook::new(
            client.clone(),
            config.upstream.reachability_url.clone(),
            config.upstream.credential_timeout(),
        ));

        registry.register_hook(
            ErrorCategory::UpstreamAuth,
            Arc::new(CredentialRefreshHook::new(token_source.clone())),
        );
        registry.register_hook(ErrorCategory::UpstreamNetwork, probe.clone());
        registry.register_hook(
            ErrorCategory::SessionError,
            Arc::new(BridgeRestartHook::new(bridge.clone())),
        );

        let monitor = Arc::new(HealthMonitor::new(
            config.health.clone(),
            registry.clone(),
            active_connections.clone(),
        ));
        monitor.add_check(Arc::new(CredentialCheck::new(token_source.clone())));
        monitor.add_check(Arc::new(ReachabilityCheck::new(probe)));
        monitor.add_check(Arc::new(ConnectionCheck::new(
            active_connections.clone(),
            config.health.max_active_connections,
        )));
        monitor.add_check(Arc::new(MemoryCheck::new(config.health.memory_ceiling_mb)));

        // 监控器经由注册表间接持有桥接，这里用弱引用避免循环
        let weak_monitor = Arc::downgrade(&monitor);
        bridge.set_error_reporter(Arc::new(move |error: &RelayError| {
            if let Some(monitor) = weak_monitor.upgrade() {
                monitor.record_error(error, Some("bridge"));
            }
        }));

        let router = FailureRouter::new(registry.clone(), monitor.clone());
        let transport = DirectLiveTransport::new(token_source.clone(), config.upstream.location.clone())
            .with_api_key_endpoint(config.upstream.api_key_ws_endpoint.clone())
            .with_bearer_endpoint(config.upstream.bearer_ws_endpoint.clone());
        let negotiator = FormatNegotiator::new(
            FormatContext {
                project_id: config.upstream.project_id.clone(),
                location: config.upstream.location.clone(),
            },
            config.upstream.attempt_timeout(),
        );

        let strategies: Vec<Arc<dyn UpstreamStrategy>> = vec![
            Arc::new(BridgeStrategy::new(bridge.clone())),
            Arc::new(DirectLiveStrategy::new(
                negotiator,
                Arc::new(transport),
                token_source.clone(),
                router.clone(),
                config.upstream.live_models.clone(),
            )),
            Arc::new(SdkFallbackStrategy::new(
                SdkFallbackClient::new(client, token_source.clone(), &config.upstream),
                router.clone(),
            )),
        ];
        let orchestrator = Arc::new(UpstreamOrchestrator::new(strategies, router));
        let guard = Arc::new(ConnectionGuard::new(&config, active_connections));

        tracing::info!(
            "[CONTEXT] 初始化完成: env={}, 凭证来源={}, 策略={:?}",
            config.environment,
            token_source.source_name(),
            orchestrator.strategy_names()
        );

        Ok(Self {
            config,
            registry,
            monitor,
            bridge,
            orchestrator,
            guard,
            token_source,
        })
    }

    pub fn is_production(&self) -> bool {
        self.config.is_production()
    }

    /// 未收到 setup 时使用的模型
    pub fn default_model(&self) -> String {
        self.config
            .upstream
            .live_models
            .first()
            .cloned()
            .unwrap_or_else(|| self.config.upstream.sdk_fallback_model.clone())
    }
}
