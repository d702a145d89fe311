//! `POST /generate`：配额准入 → 后端选择 → 请求构造 → 上游调用 → 归一化 → 记账。
//!
//! 任何错误路径都不会修改计数；只有归一化成功后才 commit。

use crate::config::Config;
use crate::error::AppError;
use crate::gateway::normalize::{attach_usage, map_error, normalize};
use crate::gateway::transform;
use crate::gateway::types::GenerateRequest;
use crate::ledger::UsageLedger;
use crate::logging;
use crate::pricing::{QualityChoice, QualityTier, clamp_to_budget};
use crate::runtime_config::{self, RuntimeSettings};
use crate::upstream::selector::{self, BackendKind};
use crate::upstream::{Upstream, UpstreamClient};
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug)]
pub struct AppState {
    pub cfg: Config,
    pub ledger: Arc<UsageLedger>,
    pub upstream: UpstreamClient,
}

pub fn request_id() -> String {
    format!("gen-{}", Uuid::new_v4().simple())
}

pub async fn handle_generate(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let settings = runtime_config::get();
    let log_level = settings.log_level();
    let request_id = request_id();
    logging::client_request(log_level, method.as_str(), uri.0.path(), &headers, &body);

    let span = tracing::info_span!("generate", %request_id);
    let result = run(&state.cfg, &settings, &state.ledger, &state.upstream, &body)
        .instrument(span)
        .await;

    let mut resp = match result {
        Ok(out) => {
            logging::client_response(log_level, StatusCode::OK.as_u16(), start.elapsed(), &out);
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                out,
            )
                .into_response()
        }
        Err(e) => {
            let status = e.status();
            if status.is_server_error() {
                tracing::warn!(%request_id, error = %e, code = e.code(), "生成请求失败");
            } else {
                tracing::info!(%request_id, error = %e, code = e.code(), "生成请求被拒绝");
            }
            let logged = match &e {
                AppError::Upstream { body, .. } => body.to_vec(),
                other => other.to_body_bytes().unwrap_or_default(),
            };
            logging::client_response(log_level, status.as_u16(), start.elapsed(), &logged);
            e.into_response()
        }
    };

    if let Ok(v) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

/// 入参校验；必须在任何配额读写之前完成。
fn validate(req: &GenerateRequest) -> Result<(), AppError> {
    if req.user_id().is_empty() {
        return Err(AppError::bad_request("userId 不能为空"));
    }
    if req.prompt_text().is_empty() {
        return Err(AppError::bad_request(
            "contents 中缺少文本提示词：仅上传图片时也需附带一段文字说明要如何编辑",
        ));
    }
    for content in &req.contents {
        for data in content.parts.iter().filter_map(|p| p.inline_data.as_ref()) {
            let payload = data.data.trim();
            if payload.is_empty() {
                continue;
            }
            if BASE64.decode(payload).is_err() {
                return Err(AppError::bad_request("inlineData.data 不是合法的 base64"));
            }
        }
    }
    Ok(())
}

fn choose_quality(req: &GenerateRequest, settings: &RuntimeSettings) -> QualityChoice {
    let requested = match req.image_quality.as_deref().map(str::trim) {
        None | Some("") => settings.default_quality,
        Some(raw) => QualityTier::parse(raw).unwrap_or_else(|| {
            tracing::warn!(
                "未知的 imageQuality={raw}，使用默认画质 {}",
                settings.default_quality.as_str()
            );
            settings.default_quality
        }),
    };

    let choice = clamp_to_budget(requested, &settings.prices, settings.quality_budget_usd);
    if choice.downgraded() {
        tracing::info!(
            requested = requested.as_str(),
            effective = choice.effective.as_str(),
            unit_price = choice.unit_price,
            budget = settings.quality_budget_usd,
            "画质超出预算，已降级"
        );
    }
    choice
}

/// 完整的生成流程。上游以泛型注入，测试中可替换为假实现。
pub async fn run<U: Upstream>(
    cfg: &Config,
    settings: &RuntimeSettings,
    ledger: &UsageLedger,
    upstream: &U,
    body: &[u8],
) -> Result<Vec<u8>, AppError> {
    let req: GenerateRequest = sonic_rs::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("请求体不是合法 JSON: {e}")))?;
    let raw: sonic_rs::Value = sonic_rs::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("请求体不是合法 JSON: {e}")))?;
    validate(&req)?;

    let user_id = req.user_id();
    let decision = ledger.evaluate(user_id, req.is_premium).await;
    if !decision.can_generate {
        return Err(AppError::QuotaExceeded(decision));
    }

    let selection = selector::select(&req, cfg, upstream.has_image_credentials())?;
    let quality = match selection.backend {
        BackendKind::Image => Some(choose_quality(&req, settings)),
        BackendKind::Text => None,
    };

    tracing::info!(
        user_id,
        is_premium = req.is_premium,
        backend = selection.backend.as_str(),
        model = %selection.model_id,
        quality = quality.map(|q| q.effective.as_str()),
        remaining = decision.remaining,
        "生成请求已准入"
    );

    let payload = transform::build(&req, &raw, &selection, quality.as_ref())?;
    let reply = upstream.send(&selection, payload).await?;
    if !reply.is_success() {
        return Err(map_error(reply));
    }

    let mut out = normalize(&reply.body, &selection)?;

    ledger.commit(user_id, req.is_premium).await;
    let after = ledger.evaluate(user_id, req.is_premium).await;
    attach_usage(&mut out, &after, quality.as_ref())?;

    sonic_rs::to_vec(&out).map_err(|e| AppError::Anyhow(e.into()))
}
