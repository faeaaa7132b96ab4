//! 配置模块
//!
//! 从 YAML 文件加载中继配置，再用环境变量覆盖。
//! 与运行环境相关的默认值（每 IP 连接数、消息速率）在覆盖之后才解析。

use crate::resilience::{ErrorCategory, RecoveryStrategy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),
    #[error("解析配置文件失败: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 中继总配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// 运行环境（development / production）
    pub environment: String,
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub upstream: UpstreamConfig,
    pub bridge: BridgeConfig,
    pub recovery: RecoveryConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

/// HTTP / WebSocket 监听配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 客户端 WebSocket 路径
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            ws_path: "/api/live".to_string(),
        }
    }
}

/// 网关准入配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// 允许的 Origin 列表（仅生产环境生效；未带 Origin 的连接总是放行）
    pub allowed_origins: Vec<String>,
    /// 客户端认证 token（生产环境必需）
    pub auth_token: Option<String>,
    /// 单条消息最大字节数
    pub max_payload_bytes: usize,
    /// 每 IP 并发连接上限；未设置时按环境取 3 / 50
    pub max_connections_per_ip: Option<usize>,
    /// 速率窗口内最大消息数；未设置时按环境取 40 / 200
    pub max_messages_per_window: Option<u32>,
    /// 速率窗口（毫秒）
    pub rate_window_ms: u64,
    /// 单轮对话总超时（毫秒）
    pub turn_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            auth_token: None,
            max_payload_bytes: 262_144,
            max_connections_per_ip: None,
            max_messages_per_window: None,
            rate_window_ms: 10_000,
            turn_timeout_ms: 120_000,
        }
    }
}

impl GatewayConfig {
    pub fn connections_per_ip(&self, production: bool) -> usize {
        self.max_connections_per_ip
            .unwrap_or(if production { 3 } else { 50 })
    }

    pub fn messages_per_window(&self, production: bool) -> u32 {
        self.max_messages_per_window
            .unwrap_or(if production { 40 } else { 200 })
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }
}

/// 上游配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// API Key（走 generativelanguage 端点）
    pub api_key: Option<String>,
    /// 静态 Bearer token（走 Vertex 端点）
    pub access_token: Option<String>,
    /// 未配置静态 token 时是否通过 gcloud 获取
    pub use_gcloud: bool,
    pub project_id: Option<String>,
    pub location: String,
    /// 直连策略依次尝试的 Live 模型
    pub live_models: Vec<String>,
    /// SDK 回退使用的非 Live 模型
    pub sdk_fallback_model: String,
    /// 每次协商尝试的超时（毫秒）
    pub attempt_timeout_ms: u64,
    /// 凭证探测超时（毫秒）
    pub credential_timeout_ms: u64,
    /// gcloud access token 的缓存时长（毫秒），远小于 token 本身的一小时有效期
    pub token_ttl_ms: u64,
    /// 可达性探测地址
    pub reachability_url: String,
    /// 覆盖 API Key 模式的 WebSocket 端点（测试用）
    pub api_key_ws_endpoint: Option<String>,
    /// 覆盖 Bearer 模式的 WebSocket 端点（默认按 location 拼 Vertex 区域端点）
    pub bearer_ws_endpoint: Option<String>,
    /// 覆盖 SDK 回退的 REST 基础地址（测试用）
    pub sdk_base_url: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            access_token: None,
            use_gcloud: true,
            project_id: None,
            location: "us-central1".to_string(),
            live_models: vec![
                "gemini-2.0-flash-live-preview-04-09".to_string(),
                "gemini-2.5-flash-live".to_string(),
                "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                "gemini-live-2.5-flash-preview".to_string(),
                "gemini-live-2.5-flash".to_string(),
            ],
            sdk_fallback_model: "gemini-2.5-flash".to_string(),
            attempt_timeout_ms: 30_000,
            credential_timeout_ms: 5_000,
            token_ttl_ms: 300_000,
            reachability_url: "https://generativelanguage.googleapis.com".to_string(),
            api_key_ws_endpoint: None,
            bearer_ws_endpoint: None,
            sdk_base_url: None,
        }
    }
}

impl UpstreamConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn credential_timeout(&self) -> Duration {
        Duration::from_millis(self.credential_timeout_ms)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_millis(self.token_ttl_ms)
    }
}

/// 子进程桥接配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    /// 辅助进程可执行文件
    pub program: String,
    pub args: Vec<String>,
    /// 启动后等待 ready 的超时（毫秒）
    pub ready_timeout_ms: u64,
    /// 单个请求超时（毫秒）
    pub request_timeout_ms: u64,
    /// 进程退出后重启延迟（毫秒）
    pub restart_delay_ms: u64,
    /// 单行 JSON 最大长度
    pub max_line_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: "python3".to_string(),
            args: vec!["live-api-python-service.py".to_string()],
            ready_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            restart_delay_ms: 5_000,
            max_line_bytes: 1024 * 1024,
        }
    }
}

impl BridgeConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// 恢复策略配置（按错误类别）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub upstream_auth: RecoveryStrategy,
    pub upstream_protocol: RecoveryStrategy,
    pub upstream_network: RecoveryStrategy,
    pub session_error: RecoveryStrategy,
    pub unknown: RecoveryStrategy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            upstream_auth: ErrorCategory::UpstreamAuth.default_strategy(),
            upstream_protocol: ErrorCategory::UpstreamProtocol.default_strategy(),
            upstream_network: ErrorCategory::UpstreamNetwork.default_strategy(),
            session_error: ErrorCategory::SessionError.default_strategy(),
            unknown: ErrorCategory::Unknown.default_strategy(),
        }
    }
}

impl RecoveryConfig {
    pub fn strategy_for(&self, category: ErrorCategory) -> &RecoveryStrategy {
        match category {
            ErrorCategory::UpstreamAuth => &self.upstream_auth,
            ErrorCategory::UpstreamProtocol => &self.upstream_protocol,
            ErrorCategory::UpstreamNetwork => &self.upstream_network,
            ErrorCategory::SessionError => &self.session_error,
            ErrorCategory::Unknown => &self.unknown,
        }
    }
}

/// 健康监控配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    /// 窗口内错误数阈值
    pub error_threshold: usize,
    /// 错误检测滑动窗口（毫秒）
    pub error_window_ms: u64,
    /// 保留的最近错误条数
    pub recent_errors_limit: usize,
    /// 单项检查超时（毫秒）
    pub check_timeout_ms: u64,
    /// 常驻内存上限（MB）
    pub memory_ceiling_mb: u64,
    /// 活跃连接数的合理上限
    pub max_active_connections: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            error_threshold: 10,
            error_window_ms: 60_000,
            recent_errors_limit: 100,
            check_timeout_ms: 5_000,
            memory_ceiling_mb: 1024,
            max_active_connections: 1000,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_millis(self.error_window_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
        }
    }
}

impl RelayConfig {
    /// 加载配置：YAML 文件（可选）→ 环境变量覆盖 → 校验
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// 应用环境变量覆盖
    ///
    /// `lookup` 便于测试时注入变量表
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| lookup(*name))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };

        if let Some(env) = first(&["RELAY_ENV", "NODE_ENV"]) {
            self.environment = env;
        }
        if let Some(key) = first(&["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"]) {
            self.upstream.api_key = Some(key);
        }
        if let Some(token) = first(&["GOOGLE_ACCESS_TOKEN"]) {
            self.upstream.access_token = Some(token);
        }
        if let Some(project) = first(&["GOOGLE_CLOUD_PROJECT"]) {
            self.upstream.project_id = Some(project);
        }
        if let Some(location) = first(&["GOOGLE_CLOUD_LOCATION"]) {
            self.upstream.location = location;
        }
        if let Some(origins) = first(&["CORS_ORIGINS"]) {
            self.gateway.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(token) = first(&["GEMINI_WS_TOKEN", "API_TOKEN"]) {
            self.gateway.auth_token = Some(token);
        }
        if let Some(bytes) = first(&["GEMINI_WS_MAX_PAYLOAD_BYTES"]).and_then(|v| v.parse().ok()) {
            self.gateway.max_payload_bytes = bytes;
        }
        if let Some(limit) =
            first(&["GEMINI_WS_MAX_CONNECTIONS_PER_IP"]).and_then(|v| v.parse().ok())
        {
            self.gateway.max_connections_per_ip = Some(limit);
        }
        if let Some(limit) = first(&["GEMINI_WS_MAX_MESSAGES_PER_10S"]).and_then(|v| v.parse().ok())
        {
            self.gateway.max_messages_per_window = Some(limit);
        }
        if let Some(enabled) = first(&["LIVE_BRIDGE_ENABLED"]) {
            self.bridge.enabled = matches!(enabled.as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(level) = first(&["LOG_LEVEL"]) {
            self.logging.level = level;
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "gateway.max_payload_bytes 必须大于 0".to_string(),
            ));
        }
        if self.gateway.rate_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "gateway.rate_window_ms 必须大于 0".to_string(),
            ));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.ws_path 必须以 / 开头: {}",
                self.server.ws_path
            )));
        }
        if self.upstream.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "upstream.attempt_timeout_ms 必须大于 0".to_string(),
            ));
        }
        if self.upstream.token_ttl_ms == 0 {
            return Err(ConfigError::Invalid(
                "upstream.token_ttl_ms 必须大于 0".to_string(),
            ));
        }
        if self.health.error_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.error_threshold 必须大于 0".to_string(),
            ));
        }
        if self.bridge.enabled && self.bridge.program.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "bridge.program 不能为空".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_depend_on_environment() {
        let mut config = RelayConfig::default();
        assert!(!config.is_production());
        assert_eq!(config.gateway.connections_per_ip(false), 50);
        assert_eq!(config.gateway.messages_per_window(false), 200);

        config.apply_env_overrides(lookup_from(&[("NODE_ENV", "production")]));
        assert!(config.is_production());
        assert_eq!(config.gateway.connections_per_ip(true), 3);
        assert_eq!(config.gateway.messages_per_window(true), 40);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RelayConfig::default();
        config.apply_env_overrides(lookup_from(&[
            ("GOOGLE_AI_API_KEY", "key-b"),
            ("CORS_ORIGINS", "https://a.example, ,https://b.example"),
            ("API_TOKEN", "secret"),
            ("GEMINI_WS_MAX_PAYLOAD_BYTES", "1024"),
            ("GEMINI_WS_MAX_CONNECTIONS_PER_IP", "7"),
            ("LIVE_BRIDGE_ENABLED", "true"),
        ]));

        assert_eq!(config.upstream.api_key.as_deref(), Some("key-b"));
        assert_eq!(
            config.gateway.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(config.gateway.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.gateway.max_payload_bytes, 1024);
        assert_eq!(config.gateway.connections_per_ip(true), 7);
        assert!(config.bridge.enabled);
    }

    #[test]
    fn test_primary_env_name_wins() {
        let mut config = RelayConfig::default();
        config.apply_env_overrides(lookup_from(&[
            ("GEMINI_API_KEY", "key-a"),
            ("GOOGLE_AI_API_KEY", "key-b"),
            ("GEMINI_WS_TOKEN", "ws"),
            ("API_TOKEN", "api"),
        ]));
        assert_eq!(config.upstream.api_key.as_deref(), Some("key-a"));
        assert_eq!(config.gateway.auth_token.as_deref(), Some("ws"));
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "environment: production\nserver:\n  port: 9000\nrecovery:\n  upstream_protocol:\n    max_retries: 2\n    base_backoff_ms: 50\n"
        )
        .unwrap();

        let config = RelayConfig::from_yaml_str(&std::fs::read_to_string(file.path()).unwrap())
            .unwrap();
        assert!(config.is_production());
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.ws_path, "/api/live");
        assert_eq!(config.recovery.upstream_protocol.max_retries, 2);
        assert_eq!(config.recovery.upstream_network.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.gateway.max_payload_bytes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = RelayConfig::default();
        config.server.ws_path = "live".to_string();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.upstream.token_ttl_ms = 0;
        assert!(config.validate().is_err());
    }
}
