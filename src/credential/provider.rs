use crate::config::Config;
use crate::credential::oauth;
use crate::credential::types::{CachedToken, ServiceAccountKey};
use crate::error::AppError;
use anyhow::Context;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::Mutex;

/// 凭证来源，按优先级从配置中选取第一个可用的。
#[derive(Debug, Clone)]
pub enum CredentialSource {
    StaticToken(String),
    ServiceAccount(ServiceAccountKey),
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

impl CredentialSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StaticToken(_) => "static_token",
            Self::ServiceAccount(_) => "service_account",
            Self::RefreshToken { .. } => "refresh_token",
        }
    }
}

/// 图像后端的 Bearer token 提供者：缓存 token，并发调用方共享同一次刷新。
#[derive(Debug)]
pub struct TokenProvider {
    source: Option<CredentialSource>,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(source: Option<CredentialSource>, http: reqwest::Client) -> Self {
        let cached = match &source {
            Some(CredentialSource::StaticToken(t)) => Some(CachedToken {
                access_token: t.clone(),
                expires_at: None,
            }),
            _ => None,
        };
        Self {
            source,
            http,
            cached: Mutex::new(cached),
        }
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }
        let http = builder.build().context("初始化凭证 HTTP 客户端失败")?;

        Ok(Self::new(resolve_source(cfg), http))
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn source_kind(&self) -> Option<&'static str> {
        self.source.as_ref().map(CredentialSource::kind)
    }

    /// 服务账号 JSON 中携带的项目 ID（未显式配置 VERTEX_PROJECT_ID 时使用）。
    pub fn project_hint(&self) -> Option<&str> {
        match &self.source {
            Some(CredentialSource::ServiceAccount(key)) if !key.project_id.trim().is_empty() => {
                Some(key.project_id.trim())
            }
            _ => None,
        }
    }

    /// 返回可用的 access_token；缓存即将过期时同步刷新。
    pub async fn access_token(&self) -> Result<String, AppError> {
        let mut cached = self.cached.lock().await;
        if let Some(tok) = cached.as_ref()
            && !tok.is_expiring(Utc::now())
        {
            return Ok(tok.access_token.clone());
        }

        let fresh = self.fetch().await?;
        let token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(token)
    }

    /// 后台刷新：仅在缓存缺失或即将过期时刷新。返回下次检查前应等待的时长。
    pub async fn refresh_if_expiring(&self) -> Result<Duration, AppError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some(tok) = cached.as_ref()
            && !tok.is_expiring(now)
        {
            return Ok(until_refresh(tok, now));
        }

        let fresh = self.fetch().await?;
        let wait = until_refresh(&fresh, now);
        *cached = Some(fresh);
        Ok(wait)
    }

    async fn fetch(&self) -> Result<CachedToken, AppError> {
        let now = Utc::now();
        match &self.source {
            None => Err(AppError::config("图像后端未配置任何凭证来源")),
            Some(CredentialSource::StaticToken(t)) => Ok(CachedToken {
                access_token: t.clone(),
                expires_at: None,
            }),
            Some(CredentialSource::ServiceAccount(key)) => {
                let resp = oauth::exchange_service_account(&self.http, key).await?;
                Ok(CachedToken::from_response(resp, now))
            }
            Some(CredentialSource::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
            }) => {
                let resp =
                    oauth::exchange_refresh_token(&self.http, client_id, client_secret, refresh_token)
                        .await?;
                Ok(CachedToken::from_response(resp, now))
            }
        }
    }
}

fn until_refresh(tok: &CachedToken, now: chrono::DateTime<Utc>) -> Duration {
    match tok.expires_at {
        Some(at) => (at - crate::credential::types::EXPIRY_SKEW - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
        None => Duration::from_secs(30 * 60),
    }
}

fn resolve_source(cfg: &Config) -> Option<CredentialSource> {
    if !cfg.vertex_access_token.is_empty() {
        return Some(CredentialSource::StaticToken(cfg.vertex_access_token.clone()));
    }

    if !cfg.service_account_path.is_empty() {
        match load_service_account(&cfg.service_account_path) {
            Ok(key) => return Some(CredentialSource::ServiceAccount(key)),
            Err(e) => tracing::warn!("加载服务账号凭证失败: {e:#}"),
        }
    }

    if cfg.has_oauth_refresh_source() {
        return Some(CredentialSource::RefreshToken {
            client_id: cfg.google_client_id.clone(),
            client_secret: cfg.google_client_secret.clone(),
            refresh_token: cfg.google_refresh_token.clone(),
        });
    }

    None
}

fn load_service_account(path: &str) -> anyhow::Result<ServiceAccountKey> {
    let data = std::fs::read(path).with_context(|| format!("读取 {path} 失败"))?;
    let key: ServiceAccountKey =
        sonic_rs::from_slice(&data).with_context(|| format!("解析 {path} 失败"))?;
    anyhow::ensure!(
        !key.client_email.trim().is_empty() && !key.private_key.trim().is_empty(),
        "{path} 缺少 client_email 或 private_key"
    );
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_token_is_returned_without_exchange() {
        let p = TokenProvider::new(
            Some(CredentialSource::StaticToken("ya29.static".to_string())),
            reqwest::Client::new(),
        );
        assert!(p.has_source());
        assert_eq!(p.access_token().await.unwrap(), "ya29.static");
        assert_eq!(p.source_kind(), Some("static_token"));
    }

    #[tokio::test]
    async fn missing_source_is_a_configuration_error() {
        let p = TokenProvider::new(None, reqwest::Client::new());
        assert!(!p.has_source());
        let err = p.access_token().await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn resolve_prefers_static_token() {
        let cfg = Config {
            vertex_access_token: "tok".to_string(),
            google_client_id: "id".to_string(),
            google_client_secret: "secret".to_string(),
            google_refresh_token: "rt".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            resolve_source(&cfg),
            Some(CredentialSource::StaticToken(_))
        ));

        let cfg = Config {
            vertex_access_token: String::new(),
            ..cfg
        };
        assert!(matches!(
            resolve_source(&cfg),
            Some(CredentialSource::RefreshToken { .. })
        ));

        assert!(resolve_source(&Config::default()).is_none());
    }
}
