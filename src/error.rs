use axum::{
    Json,
    body::{Body, Bytes},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::ledger::QuotaDecision;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("{}", quota_message(.0))]
    QuotaExceeded(QuotaDecision),

    #[error("鉴权失败: {0}")]
    Authentication(String),

    /// 上游返回非 2xx：状态码与响应体原样转发给调用方。
    #[error("上游返回错误状态 {status}")]
    Upstream { status: u16, body: Bytes },

    #[error("上游响应无法识别: {0}")]
    Normalization(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("后端请求失败: {0}")]
    Backend(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorBodyInner<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner<'a> {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limits: Option<&'a QuotaDecision>,
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    pub fn normalization(message: impl Into<String>) -> Self {
        Self::Normalization(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Normalization(_) | AppError::Backend(_) => StatusCode::BAD_GATEWAY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIGURATION_ERROR",
            AppError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            AppError::Authentication(_) => "AUTHENTICATION_ERROR",
            AppError::Upstream { .. } => "UPSTREAM_ERROR",
            AppError::Normalization(_) => "NORMALIZATION_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Backend(_) => "BACKEND_UNREACHABLE",
            AppError::Anyhow(_) => "INTERNAL",
        }
    }

    fn body(&self) -> ErrorBody<'_> {
        let limits = match self {
            AppError::QuotaExceeded(d) => Some(d),
            _ => None,
        };
        ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                code: Some(self.code()),
                limits,
            },
        }
    }

    /// 客户端可见的 JSON 错误体；上游错误返回 None（原样转发）。
    pub fn to_body_bytes(&self) -> Option<Vec<u8>> {
        if matches!(self, AppError::Upstream { .. }) {
            return None;
        }
        sonic_rs::to_vec(&self.body()).ok()
    }
}

fn quota_message(d: &QuotaDecision) -> String {
    if d.is_permanent_limit {
        format!("免费额度已用完（{}/{}），升级高级版后可继续生成", d.used, d.limit)
    } else {
        format!("今日高级额度已用完（{}/{}），请明天再试", d.used, d.limit)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let AppError::Upstream { body, .. } = self {
            let content_type = if sonic_rs::from_slice::<sonic_rs::Value>(&body).is_ok() {
                "application/json"
            } else {
                "text/plain; charset=utf-8"
            };
            return (status, [(header::CONTENT_TYPE, content_type)], Body::from(body))
                .into_response();
        }

        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(is_premium: bool) -> QuotaDecision {
        QuotaDecision {
            used: 5,
            limit: 5,
            remaining: 0,
            can_generate: false,
            is_permanent_limit: !is_premium,
            is_premium,
            resets_at: None,
        }
    }

    #[test]
    fn quota_exceeded_maps_to_429_with_limits() {
        let err = AppError::QuotaExceeded(decision(false));
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let s = String::from_utf8(err.to_body_bytes().unwrap()).unwrap();
        assert!(s.contains("\"code\":\"QUOTA_EXCEEDED\""));
        assert!(s.contains("\"isPermanentLimit\":true"));
        assert!(s.contains("\"remaining\":0"));
    }

    #[test]
    fn upstream_error_keeps_provider_status() {
        let err = AppError::Upstream {
            status: 403,
            body: Bytes::from_static(b"{\"error\":{\"message\":\"denied\"}}"),
        };
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(err.to_body_bytes().is_none());
    }

    #[test]
    fn config_and_auth_errors_use_expected_classes() {
        assert_eq!(
            AppError::config("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::authentication("x").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::normalization("x").status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
