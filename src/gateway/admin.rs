//! 管理接口：查询/重置用户配额、查看账本、修改运行时定价与日志级别。
//!
//! 所有路由经 `admin_auth_middleware` 校验 `x-admin-key`；未配置 ADMIN_KEY 时一律 401。

use crate::gateway::generate::AppState;
use crate::runtime_config::{self, AdminSettings};
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

fn is_authorized(headers: &HeaderMap, admin_key: &str) -> bool {
    if admin_key.is_empty() {
        return false;
    }
    headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == admin_key)
}

/// 管理接口认证中间件
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if is_authorized(&headers, &state.cfg.admin_key) {
        return next.run(request).await;
    }

    tracing::warn!(path = %request.uri().path(), "管理接口鉴权失败");
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": { "message": "缺少或错误的 x-admin-key", "code": "UNAUTHORIZED" }
        })),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct QuotaQuery {
    #[serde(default)]
    pub premium: bool,
}

/// GET /admin/quota/{userId}?premium=bool
pub async fn handle_quota_get(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<QuotaQuery>,
) -> Response {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "userId 不能为空").into_response();
    }

    let decision = state.ledger.evaluate(user_id, query.premium).await;
    Json(serde_json::json!({ "userId": user_id, "quota": decision })).into_response()
}

/// POST /admin/quota/{userId}/reset
pub async fn handle_quota_reset(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Response {
    let user_id = user_id.trim();
    let existed = state.ledger.reset(user_id).await;
    tracing::info!(user_id, existed, "管理员重置用户配额");
    Json(serde_json::json!({ "success": true, "userId": user_id, "existed": existed }))
        .into_response()
}

/// POST /admin/quota/clear
pub async fn handle_quota_clear(State(state): State<Arc<AppState>>) -> Response {
    let cleared = state.ledger.clear_all().await;
    tracing::info!(cleared, "管理员清空用量账本");
    Json(serde_json::json!({ "success": true, "cleared": cleared })).into_response()
}

/// GET /admin/users
pub async fn handle_users(State(state): State<Arc<AppState>>) -> Response {
    let users: Vec<serde_json::Value> = state
        .ledger
        .snapshot()
        .await
        .into_iter()
        .map(|(user_id, record)| serde_json::json!({ "userId": user_id, "record": record }))
        .collect();
    Json(serde_json::json!({ "count": users.len(), "users": users })).into_response()
}

/// GET /admin/settings
pub async fn handle_settings_get() -> Response {
    let settings = runtime_config::get();
    Json(AdminSettings::from_runtime(&settings)).into_response()
}

/// 设置保存响应
#[derive(Serialize)]
struct SettingsResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// POST /admin/settings
pub async fn handle_settings_post(Json(req): Json<AdminSettings>) -> Response {
    if let Err(msg) = req.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(SettingsResponse {
                success: false,
                error: Some(msg.to_string()),
            }),
        )
            .into_response();
    }

    let new_settings = req.to_runtime();
    tracing::info!(
        "设置已更新: Debug={}, 默认画质={}, 预算={}, 单价={:?}",
        new_settings.debug,
        new_settings.default_quality.as_str(),
        new_settings.quality_budget_usd,
        new_settings.prices
    );
    runtime_config::update(new_settings);

    Json(SettingsResponse {
        success: true,
        error: None,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credential::TokenProvider;
    use crate::ledger::UsageLedger;
    use crate::upstream::UpstreamClient;
    use axum::body::to_bytes;
    use axum::http::HeaderValue;

    fn state() -> Arc<AppState> {
        let cfg = Config {
            admin_key: "secret".to_string(),
            free_lifetime_limit: 3,
            ..Config::default()
        };
        let tokens = Arc::new(TokenProvider::new(None, reqwest::Client::new()));
        Arc::new(AppState {
            ledger: Arc::new(UsageLedger::from_config(&cfg)),
            upstream: UpstreamClient::new(&cfg, tokens).unwrap(),
            cfg,
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn admin_key_is_required() {
        let mut headers = HeaderMap::new();
        assert!(!is_authorized(&headers, "secret"));

        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(!is_authorized(&headers, "secret"));

        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("secret"));
        assert!(is_authorized(&headers, "secret"));

        // 未配置 ADMIN_KEY 时即使请求头为空也拒绝
        let empty = HeaderMap::new();
        assert!(!is_authorized(&empty, ""));
    }

    #[tokio::test]
    async fn reset_restores_free_quota() {
        let state = state();
        for _ in 0..3 {
            state.ledger.commit("zoe", false).await;
        }
        assert!(!state.ledger.evaluate("zoe", false).await.can_generate);

        let resp = handle_quota_reset(State(state.clone()), Path("zoe".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["existed"], true);

        let resp = handle_quota_get(
            State(state.clone()),
            Path("zoe".to_string()),
            Query(QuotaQuery::default()),
        )
        .await;
        let v = body_json(resp).await;
        assert_eq!(v["quota"]["used"], 0);
        assert_eq!(v["quota"]["remaining"], 3);
        assert_eq!(v["quota"]["isPermanentLimit"], true);
    }

    #[tokio::test]
    async fn users_and_clear() {
        let state = state();
        state.ledger.commit("a", false).await;
        state.ledger.commit("b", true).await;

        let v = body_json(handle_users(State(state.clone())).await).await;
        assert_eq!(v["count"], 2);
        assert_eq!(v["users"][0]["userId"], "a");
        assert_eq!(v["users"][1]["record"]["dailyPremiumUsed"], 1);

        let v = body_json(handle_quota_clear(State(state.clone())).await).await;
        assert_eq!(v["cleared"], 2);
        assert!(state.ledger.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let mut req = AdminSettings::from_runtime(&runtime_config::get());
        req.quality_budget_usd = -1.0;
        let resp = handle_settings_post(Json(req)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["success"], false);
    }
}
