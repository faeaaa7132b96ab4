//! 上游凭证 Trait 定义
//!
//! 直连 Live 与 SDK 回退共用同一个凭证来源；
//! 认证类错误的修复钩子通过 `invalidate` 丢弃缓存后重新获取。

use crate::error::RelayError;
use async_trait::async_trait;

/// 上游凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCredential {
    /// API Key，走 generativelanguage 端点
    ApiKey(String),
    /// OAuth Bearer token，走 Vertex 端点
    Bearer { token: String },
}

impl UpstreamCredential {
    /// 认证模式名称
    pub fn mode(&self) -> &'static str {
        match self {
            UpstreamCredential::ApiKey(_) => "api_key",
            UpstreamCredential::Bearer { .. } => "bearer",
        }
    }

    /// 日志用的遮蔽形式，仅保留末 4 位
    pub fn masked(&self) -> String {
        let secret = match self {
            UpstreamCredential::ApiKey(key) => key,
            UpstreamCredential::Bearer { token } => token,
        };
        let chars: Vec<char> = secret.chars().collect();
        if chars.len() <= 8 {
            return "***".to_string();
        }
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("***{}", tail)
    }
}

/// 凭证来源 Trait
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// 获取当前可用凭证（可能来自缓存）
    async fn credential(&self) -> Result<UpstreamCredential, RelayError>;

    /// 丢弃缓存，下次 `credential` 重新获取
    fn invalidate(&self);

    /// 来源名称
    fn source_name(&self) -> &'static str;
}
