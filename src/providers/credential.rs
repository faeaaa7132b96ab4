//! 上游凭证来源
//!
//! - `StaticTokenSource`：配置或环境变量里的 API Key / Bearer token
//! - `GcloudTokenSource`：调用 `gcloud auth application-default print-access-token`，
//!   带超时，结果缓存到 TTL 过期或被认证钩子作废为止

use super::traits::{TokenSource, UpstreamCredential};
use crate::config::UpstreamConfig;
use crate::error::RelayError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;

/// gcloud token 默认缓存时长
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// 固定凭证
pub struct StaticTokenSource {
    credential: Option<UpstreamCredential>,
}

impl StaticTokenSource {
    pub fn new(credential: UpstreamCredential) -> Self {
        Self {
            credential: Some(credential),
        }
    }

    /// 未配置任何凭证，`credential` 总是返回认证错误
    pub fn unconfigured() -> Self {
        Self { credential: None }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn credential(&self) -> Result<UpstreamCredential, RelayError> {
        self.credential
            .clone()
            .ok_or_else(|| RelayError::Credential("no upstream credential configured".to_string()))
    }

    fn invalidate(&self) {}

    fn source_name(&self) -> &'static str {
        if self.credential.is_some() {
            "static"
        } else {
            "unconfigured"
        }
    }
}

/// 通过 gcloud CLI 获取 access token
pub struct GcloudTokenSource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    ttl: Duration,
    cached: RwLock<Option<(String, Instant)>>,
}

impl GcloudTokenSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "gcloud".to_string(),
            args: vec![
                "auth".to_string(),
                "application-default".to_string(),
                "print-access-token".to_string(),
            ],
            timeout,
            ttl: DEFAULT_TOKEN_TTL,
            cached: RwLock::new(None),
        }
    }

    /// 设置缓存时长
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// 未过期的缓存 token
    fn fresh_token(&self) -> Option<String> {
        let cached = self.cached.read();
        match cached.as_ref() {
            Some((token, fetched_at)) if fetched_at.elapsed() < self.ttl => Some(token.clone()),
            _ => None,
        }
    }

    /// 替换执行的命令
    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }

    async fn fetch(&self) -> Result<String, RelayError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&self.args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            RelayError::Credential(format!(
                "{} did not return a token within {}ms",
                self.program,
                self.timeout.as_millis()
            ))
        })?
        .map_err(|e| RelayError::Credential(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::Credential(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(RelayError::Credential(format!(
                "{} returned an empty token",
                self.program
            )));
        }
        Ok(token)
    }
}

#[async_trait]
impl TokenSource for GcloudTokenSource {
    async fn credential(&self) -> Result<UpstreamCredential, RelayError> {
        if let Some(token) = self.fresh_token() {
            return Ok(UpstreamCredential::Bearer { token });
        }

        let token = self.fetch().await?;
        tracing::info!("[CREDENTIAL] 已通过 {} 获取 access token", self.program);
        *self.cached.write() = Some((token.clone(), Instant::now()));
        Ok(UpstreamCredential::Bearer { token })
    }

    fn invalidate(&self) {
        if self.cached.write().take().is_some() {
            tracing::debug!("[CREDENTIAL] 已作废缓存的 access token");
        }
    }

    fn source_name(&self) -> &'static str {
        "gcloud"
    }
}

/// 按配置选择凭证来源：API Key > 静态 Bearer > gcloud
pub fn build_token_source(config: &UpstreamConfig) -> Arc<dyn TokenSource> {
    if let Some(key) = config.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
        tracing::info!("[CREDENTIAL] 使用 API Key 认证");
        return Arc::new(StaticTokenSource::new(UpstreamCredential::ApiKey(
            key.trim().to_string(),
        )));
    }
    if let Some(token) = config.access_token.as_ref().filter(|t| !t.trim().is_empty()) {
        tracing::info!("[CREDENTIAL] 使用静态 access token 认证");
        return Arc::new(StaticTokenSource::new(UpstreamCredential::Bearer {
            token: token.trim().to_string(),
        }));
    }
    if config.use_gcloud {
        tracing::info!("[CREDENTIAL] 使用 gcloud application-default 凭证");
        return Arc::new(
            GcloudTokenSource::new(config.credential_timeout()).with_ttl(config.token_ttl()),
        );
    }
    tracing::warn!("[CREDENTIAL] 未配置任何上游凭证");
    Arc::new(StaticTokenSource::unconfigured())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_prefers_api_key() {
        let config = UpstreamConfig {
            api_key: Some(" key-123 ".into()),
            access_token: Some("token".into()),
            ..Default::default()
        };
        assert_eq!(build_token_source(&config).source_name(), "static");

        let config = UpstreamConfig {
            api_key: None,
            access_token: None,
            use_gcloud: false,
            ..Default::default()
        };
        assert_eq!(build_token_source(&config).source_name(), "unconfigured");

        let config = UpstreamConfig::default();
        assert_eq!(build_token_source(&config).source_name(), "gcloud");
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticTokenSource::new(UpstreamCredential::ApiKey("k".into()));
        assert_eq!(
            source.credential().await.unwrap(),
            UpstreamCredential::ApiKey("k".into())
        );

        let missing = StaticTokenSource::unconfigured();
        assert!(matches!(
            missing.credential().await,
            Err(RelayError::Credential(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gcloud_source_caches_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let script = format!(
            "echo x >> {0}; printf 'token-%s\\n' $(wc -l < {0} | tr -d ' ')",
            counter.display()
        );
        let source = GcloudTokenSource::new(Duration::from_secs(5))
            .with_command("sh", vec!["-c".into(), script]);

        let first = source.credential().await.unwrap();
        assert_eq!(
            first,
            UpstreamCredential::Bearer {
                token: "token-1".into()
            }
        );
        assert_eq!(source.credential().await.unwrap(), first);

        source.invalidate();
        assert_eq!(
            source.credential().await.unwrap(),
            UpstreamCredential::Bearer {
                token: "token-2".into()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gcloud_token_is_refetched_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let script = format!(
            "echo x >> {0}; printf 'token-%s\\n' $(wc -l < {0} | tr -d ' ')",
            counter.display()
        );
        let source = GcloudTokenSource::new(Duration::from_secs(5))
            .with_ttl(Duration::from_millis(200))
            .with_command("sh", vec!["-c".into(), script]);

        let first = source.credential().await.unwrap();
        assert_eq!(source.credential().await.unwrap(), first);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            source.credential().await.unwrap(),
            UpstreamCredential::Bearer {
                token: "token-2".into()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_gcloud_source_failure_and_timeout() {
        let failing = GcloudTokenSource::new(Duration::from_secs(5))
            .with_command("sh", vec!["-c".into(), "echo denied >&2; exit 1".into()]);
        let err = failing.credential().await.unwrap_err();
        assert!(err.to_string().contains("denied"));

        let slow = GcloudTokenSource::new(Duration::from_millis(100))
            .with_command("sh", vec!["-c".into(), "sleep 5".into()]);
        assert!(matches!(
            slow.credential().await,
            Err(RelayError::Credential(_))
        ));
    }
}
