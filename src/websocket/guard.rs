//! 连接准入
//!
//! 握手完成前依次检查 Origin、每 IP 并发连接数、认证 token。
//! 通过后发放 [`ConnectionPermit`]，连接关闭时自动归还名额。

use crate::config::RelayConfig;
use crate::error::RelayError;
use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// 常量时间比较，避免按字节提前返回
pub fn constant_time_eq(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// 从 `Authorization: Bearer` 或 `?token=` 提取客户端 token
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());
    if bearer.is_some() {
        return bearer;
    }

    query.and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
            .filter(|token| !token.is_empty())
    })
}

/// 连接准入守卫（进程内共享）
pub struct ConnectionGuard {
    production: bool,
    allowed_origins: Vec<String>,
    auth_token: Option<String>,
    max_connections_per_ip: usize,
    per_ip: DashMap<IpAddr, usize>,
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(config: &RelayConfig, active: Arc<AtomicUsize>) -> Self {
        let production = config.is_production();
        Self {
            production,
            allowed_origins: config.gateway.allowed_origins.clone(),
            auth_token: config
                .gateway
                .auth_token
                .clone()
                .filter(|token| !token.trim().is_empty()),
            max_connections_per_ip: config.gateway.connections_per_ip(production),
            per_ip: DashMap::new(),
            active,
        }
    }

    pub fn is_production(&self) -> bool {
        self.production
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn connections_from(&self, ip: &IpAddr) -> usize {
        self.per_ip.get(ip).map(|count| *count).unwrap_or(0)
    }

    /// 开发环境不限制；生产环境下带 Origin 的连接必须在允许列表中
    pub fn check_origin(&self, origin: Option<&str>) -> Result<(), RelayError> {
        let origin = origin.map(str::trim).unwrap_or_default();
        if origin.is_empty() || !self.production {
            return Ok(());
        }
        if self.allowed_origins.iter().any(|allowed| allowed == origin) {
            Ok(())
        } else {
            Err(RelayError::ClientRejected {
                status: 403,
                reason: "Origin not allowed".to_string(),
            })
        }
    }

    /// 生产环境要求 token；未配置 token 时整个入口处于禁用状态
    pub fn check_auth(&self, provided: Option<&str>) -> Result<(), RelayError> {
        if !self.production {
            return Ok(());
        }
        let Some(expected) = self.auth_token.as_deref() else {
            return Err(RelayError::ClientRejected {
                status: 403,
                reason: "Disabled in production unless an auth token is configured".to_string(),
            });
        };
        match provided {
            Some(token) if constant_time_eq(token, expected) => Ok(()),
            _ => Err(RelayError::ClientRejected {
                status: 401,
                reason: "Unauthorized".to_string(),
            }),
        }
    }

    /// 占用一个每 IP 连接名额
    pub fn acquire(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionPermit, RelayError> {
        {
            let mut count = self.per_ip.entry(ip).or_insert(0);
            if *count >= self.max_connections_per_ip {
                return Err(RelayError::ClientRejected {
                    status: 429,
                    reason: "Too many connections".to_string(),
                });
            }
            *count += 1;
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(ConnectionPermit {
            guard: Arc::clone(self),
            ip,
        })
    }

    /// 完整准入：Origin → 连接数 → 认证
    pub fn admit(
        self: &Arc<Self>,
        ip: IpAddr,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<ConnectionPermit, RelayError> {
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());
        self.check_origin(origin)?;

        if self.connections_from(&ip) >= self.max_connections_per_ip {
            return Err(RelayError::ClientRejected {
                status: 429,
                reason: "Too many connections".to_string(),
            });
        }

        let token = extract_token(headers, query);
        self.check_auth(token.as_deref())?;

        self.acquire(ip)
    }

    fn release(&self, ip: &IpAddr) {
        if let Some(mut count) = self.per_ip.get_mut(ip) {
            *count = count.saturating_sub(1);
        }
        self.per_ip.remove_if(ip, |_, count| *count == 0);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 连接名额，drop 时归还
pub struct ConnectionPermit {
    guard: Arc<ConnectionGuard>,
    ip: IpAddr,
}

impl ConnectionPermit {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.guard.release(&self.ip);
    }
}
