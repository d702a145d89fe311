use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// 提前视为过期的时间窗口，避免请求中途失效。
pub const EXPIRY_SKEW: Duration = Duration::minutes(5);

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
}

/// 服务账号 JSON 中用到的字段。
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn token_uri(&self) -> &str {
        let v = self.token_uri.trim();
        if v.is_empty() { DEFAULT_TOKEN_URI } else { v }
    }
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    /// None 表示静态 token，永不过期。
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    pub fn from_response(resp: TokenResponse, now: DateTime<Utc>) -> Self {
        let expires_in = if resp.expires_in > 0 { resp.expires_in } else { 3600 };
        Self {
            access_token: resp.access_token,
            expires_at: Some(now + Duration::seconds(expires_in)),
        }
    }

    pub fn is_expiring(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => now >= at - EXPIRY_SKEW,
            None => false,
        }
    }
}
