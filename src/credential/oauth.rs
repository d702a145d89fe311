use crate::credential::types::{DEFAULT_TOKEN_URI, ServiceAccountKey, TokenResponse};
use crate::error::AppError;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::{info, warn};

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const MAX_TOKEN_RESPONSE_BYTES: usize = 1 << 20;

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// 用 OAuth refresh_token 换取 access_token。
pub async fn exchange_refresh_token(
    http: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<TokenResponse, AppError> {
    let req = http
        .post(DEFAULT_TOKEN_URI)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .form(&[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ]);

    let token = send_token_request(req, "refresh_token").await?;
    info!("已刷新 OAuth access_token");
    Ok(token)
}

/// 用服务账号私钥签发 RS256 断言，换取 access_token。
pub async fn exchange_service_account(
    http: &reqwest::Client,
    key: &ServiceAccountKey,
) -> Result<TokenResponse, AppError> {
    let assertion = sign_assertion(key, Utc::now().timestamp())?;
    let req = http
        .post(key.token_uri())
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())]);

    let token = send_token_request(req, "service_account").await?;
    info!("已为服务账号 {} 换取 access_token", key.client_email);
    Ok(token)
}

pub fn sign_assertion(key: &ServiceAccountKey, now: i64) -> Result<String, AppError> {
    let claims = AssertionClaims {
        iss: &key.client_email,
        scope: CLOUD_PLATFORM_SCOPE,
        aud: key.token_uri(),
        iat: now,
        exp: now + 3600,
    };

    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| AppError::config(format!("服务账号私钥无效: {e}")))?;

    encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
        .map_err(|e| AppError::authentication(format!("签发服务账号断言失败: {e}")))
}

async fn send_token_request(
    req: reqwest::RequestBuilder,
    grant: &str,
) -> Result<TokenResponse, AppError> {
    let resp = req
        .send()
        .await
        .map_err(|e| AppError::authentication(format!("凭证交换请求失败（{grant}）: {e}")))?;

    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|e| AppError::authentication(format!("读取凭证响应失败（{grant}）: {e}")))?;
    if body.len() > MAX_TOKEN_RESPONSE_BYTES {
        return Err(AppError::authentication("凭证响应过大"));
    }

    if !status.is_success() {
        let detail = String::from_utf8_lossy(&body);
        warn!(
            "凭证交换失败（{grant}，HTTP {}）：{}",
            status.as_u16(),
            detail
        );
        return Err(AppError::authentication(format!(
            "凭证交换失败（HTTP {}）: {}",
            status.as_u16(),
            detail.trim()
        )));
    }

    let token = sonic_rs::from_slice::<TokenResponse>(&body)
        .map_err(|e| AppError::authentication(format!("凭证响应解析失败: {e}")))?;
    if token.access_token.trim().is_empty() {
        return Err(AppError::authentication("凭证响应缺少 access_token"));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_private_key_is_a_configuration_error() {
        let key = ServiceAccountKey {
            client_email: "svc@example.iam.gserviceaccount.com".to_string(),
            private_key: "not a pem".to_string(),
            project_id: String::new(),
            token_uri: String::new(),
        };
        let err = sign_assertion(&key, 1_700_000_000).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
