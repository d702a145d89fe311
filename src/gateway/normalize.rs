//! 上游响应归一化。
//!
//! 图像后端的成功响应有多种字段布局，按固定顺序尝试，第一个命中者胜出；
//! 全部不命中属于硬错误，绝不返回空的成功响应。文本后端响应原样透传。

use crate::error::AppError;
use crate::ledger::QuotaDecision;
use crate::pricing::{QualityChoice, QualityTier};
use crate::upstream::{BackendKind, Selection, UpstreamReply};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sonic_rs::prelude::*;
use std::collections::HashMap;

const DEFAULT_IMAGE_MIME: &str = "image/png";

/// 归一化后的响应信封（顶层 JSON 对象）。
pub type Envelope = HashMap<String, sonic_rs::Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalCandidate {
    content: CanonicalContent,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct CanonicalContent {
    role: &'static str,
    parts: Vec<CanonicalPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalPart {
    inline_data: CanonicalInlineData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalInlineData {
    mime_type: String,
    data: String,
}

/// 附加到响应中的配额遥测，反映 commit 之后的状态。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTelemetry {
    pub used: u64,
    pub remaining: u64,
    pub limit: u64,
    pub is_premium: bool,
    pub is_permanent_limit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_quality: Option<QualityTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
}

impl UsageTelemetry {
    pub fn new(decision: &QuotaDecision, quality: Option<&QualityChoice>) -> Self {
        Self {
            used: decision.used,
            remaining: decision.remaining,
            limit: decision.limit,
            is_premium: decision.is_premium,
            is_permanent_limit: decision.is_permanent_limit,
            resets_at: decision.resets_at,
            quality: quality.map(|q| q.effective),
            requested_quality: quality.map(|q| q.requested),
            unit_price: quality.map(|q| q.unit_price),
        }
    }
}

type Extractor = fn(&sonic_rs::Value) -> Option<ExtractedImage>;

/// 图像字段布局，按优先级排列。
const IMAGE_EXTRACTORS: [(&str, Extractor); 4] = [
    ("predictions.bytesBase64Encoded", extract_direct),
    ("predictions.image", extract_nested_image),
    ("generatedImage", extract_generated_image),
    ("candidates.inlineData", extract_inline_data),
];

fn non_empty_str<'a>(v: Option<&'a sonic_rs::Value>) -> Option<&'a str> {
    v.and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn image_from(
    holder: &sonic_rs::Value,
    data_keys: &[&str],
    fallback_mime: Option<&str>,
) -> Option<ExtractedImage> {
    let data = data_keys
        .iter()
        .find_map(|k| non_empty_str(holder.get(*k)))?;
    let mime_type = non_empty_str(holder.get("mimeType"))
        .or(fallback_mime)
        .unwrap_or(DEFAULT_IMAGE_MIME);
    Some(ExtractedImage {
        mime_type: mime_type.to_string(),
        data: data.to_string(),
    })
}

fn first_prediction(v: &sonic_rs::Value) -> Option<&sonic_rs::Value> {
    v.get("predictions").and_then(|p| p.get(0))
}

fn extract_direct(v: &sonic_rs::Value) -> Option<ExtractedImage> {
    image_from(first_prediction(v)?, &["bytesBase64Encoded"], None)
}

fn extract_nested_image(v: &sonic_rs::Value) -> Option<ExtractedImage> {
    let pred = first_prediction(v)?;
    image_from(
        pred.get("image")?,
        &["bytesBase64Encoded", "imageBytes"],
        non_empty_str(pred.get("mimeType")),
    )
}

fn extract_generated_image(v: &sonic_rs::Value) -> Option<ExtractedImage> {
    const KEYS: [&str; 2] = ["bytesBase64Encoded", "imageBytes"];

    if let Some(generated) = first_prediction(v).and_then(|p| p.get("generatedImage"))
        && let Some(img) = image_from(generated, &KEYS, None)
    {
        return Some(img);
    }

    let generated = v.get("generatedImages").and_then(|g| g.get(0))?;
    match generated.get("image") {
        Some(img) => image_from(img, &KEYS, None),
        None => image_from(generated, &KEYS, None),
    }
}

fn extract_inline_data(v: &sonic_rs::Value) -> Option<ExtractedImage> {
    let parts = v
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())?;

    parts
        .iter()
        .filter_map(|p| p.get("inlineData"))
        .find_map(|d| image_from(d, &["data"], None))
}

/// 按顺序尝试各布局，返回第一个命中的图像。
pub fn extract_image(v: &sonic_rs::Value) -> Option<ExtractedImage> {
    IMAGE_EXTRACTORS.iter().find_map(|(layout, extract)| {
        let img = extract(v)?;
        tracing::debug!("图像响应命中布局 {layout}");
        Some(img)
    })
}

/// 上游因安全策略过滤掉图片时会给出原因，用于错误信息。
fn filtered_reason(v: &sonic_rs::Value) -> Option<&str> {
    non_empty_str(first_prediction(v).and_then(|p| p.get("raiFilteredReason")))
}

fn canonical_image_envelope(img: ExtractedImage) -> Result<Envelope, AppError> {
    let candidates = vec![CanonicalCandidate {
        content: CanonicalContent {
            role: "model",
            parts: vec![CanonicalPart {
                inline_data: CanonicalInlineData {
                    mime_type: img.mime_type,
                    data: img.data,
                },
            }],
        },
        finish_reason: "STOP",
    }];

    let mut out = Envelope::new();
    out.insert(
        "candidates".to_string(),
        sonic_rs::to_value(&candidates).map_err(|e| AppError::Anyhow(e.into()))?,
    );
    Ok(out)
}

/// 成功响应归一化为统一信封。
pub fn normalize(body: &[u8], selection: &Selection) -> Result<Envelope, AppError> {
    match selection.backend {
        BackendKind::Text => sonic_rs::from_slice::<Envelope>(body)
            .map_err(|e| AppError::normalization(format!("文本后端返回的不是 JSON 对象: {e}"))),
        BackendKind::Image => {
            let v: sonic_rs::Value = sonic_rs::from_slice(body)
                .map_err(|e| AppError::normalization(format!("图像后端返回的不是合法 JSON: {e}")))?;

            match extract_image(&v) {
                Some(img) => canonical_image_envelope(img),
                None => Err(AppError::normalization(match filtered_reason(&v) {
                    Some(reason) => format!("图像被上游过滤: {reason}"),
                    None => "图像后端响应中没有可识别的图像字段".to_string(),
                })),
            }
        }
    }
}

/// 非 2xx 上游响应：状态码与响应体原样转发。
pub fn map_error(reply: UpstreamReply) -> AppError {
    AppError::Upstream {
        status: reply.status,
        body: reply.body,
    }
}

pub fn attach_usage(
    out: &mut Envelope,
    decision: &QuotaDecision,
    quality: Option<&QualityChoice>,
) -> Result<(), AppError> {
    let usage = sonic_rs::to_value(&UsageTelemetry::new(decision, quality))
        .map_err(|e| AppError::Anyhow(e.into()))?;
    out.insert("usage".to_string(), usage);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::AuthMode;
    use axum::body::Bytes;

    fn image_selection() -> Selection {
        Selection {
            backend: BackendKind::Image,
            model_id: "imagen-3.0-generate-002".to_string(),
            auth: AuthMode::Bearer,
        }
    }

    fn text_selection() -> Selection {
        Selection {
            backend: BackendKind::Text,
            model_id: "gemini-2.5-flash".to_string(),
            auth: AuthMode::ApiKey,
        }
    }

    fn only_part(out: &Envelope) -> &sonic_rs::Value {
        out.get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.get(0))
            .unwrap()
    }

    #[test]
    fn nested_image_layout_defaults_to_png() {
        let body = br#"{"predictions":[{"image":{"bytesBase64Encoded":"X"}}]}"#;
        let out = normalize(body, &image_selection()).unwrap();

        let inline = only_part(&out).get("inlineData").unwrap();
        assert_eq!(inline.get("data").and_then(|v| v.as_str()), Some("X"));
        assert_eq!(inline.get("mimeType").and_then(|v| v.as_str()), Some("image/png"));

        let candidate = out.get("candidates").and_then(|c| c.get(0)).unwrap();
        assert_eq!(candidate.get("finishReason").and_then(|v| v.as_str()), Some("STOP"));
    }

    #[test]
    fn direct_layout_keeps_declared_mime() {
        let v: sonic_rs::Value = sonic_rs::from_str(
            r#"{"predictions":[{"bytesBase64Encoded":"AAA","mimeType":"image/jpeg"}]}"#,
        )
        .unwrap();
        assert_eq!(
            extract_image(&v),
            Some(ExtractedImage {
                mime_type: "image/jpeg".to_string(),
                data: "AAA".to_string(),
            })
        );
    }

    #[test]
    fn generated_image_aliases() {
        let v: sonic_rs::Value =
            sonic_rs::from_str(r#"{"generatedImages":[{"image":{"imageBytes":"G1"}}]}"#).unwrap();
        assert_eq!(extract_image(&v).unwrap().data, "G1");

        let v: sonic_rs::Value = sonic_rs::from_str(
            r#"{"predictions":[{"generatedImage":{"bytesBase64Encoded":"G2"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_image(&v).unwrap().data, "G2");
    }

    #[test]
    fn inline_data_layout_skips_text_parts() {
        let v: sonic_rs::Value = sonic_rs::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"here"},{"inlineData":{"mimeType":"image/webp","data":"W"}}]}}]}"#,
        )
        .unwrap();
        let img = extract_image(&v).unwrap();
        assert_eq!(img.data, "W");
        assert_eq!(img.mime_type, "image/webp");
    }

    #[test]
    fn direct_layout_wins_over_later_layouts() {
        let v: sonic_rs::Value = sonic_rs::from_str(
            r#"{"predictions":[{"bytesBase64Encoded":"FIRST","image":{"bytesBase64Encoded":"SECOND"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_image(&v).unwrap().data, "FIRST");
    }

    #[test]
    fn unknown_layout_is_a_hard_failure() {
        let err = normalize(br#"{"predictions":[{}]}"#, &image_selection()).unwrap_err();
        assert!(matches!(err, AppError::Normalization(_)));

        let err = normalize(
            br#"{"predictions":[{"raiFilteredReason":"blocked by safety"}]}"#,
            &image_selection(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("blocked by safety"));

        let err = normalize(b"not json", &image_selection()).unwrap_err();
        assert!(matches!(err, AppError::Normalization(_)));
    }

    #[test]
    fn text_response_passes_through() {
        let body = br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]},"finishReason":"STOP"}],"modelVersion":"gemini-2.5-flash"}"#;
        let out = normalize(body, &text_selection()).unwrap();
        assert_eq!(
            out.get("modelVersion").and_then(|v| v.as_str()),
            Some("gemini-2.5-flash")
        );
        assert_eq!(only_part(&out).get("text").and_then(|v| v.as_str()), Some("hi"));

        let err = normalize(b"[1,2]", &text_selection()).unwrap_err();
        assert!(matches!(err, AppError::Normalization(_)));
    }

    #[test]
    fn upstream_error_is_forwarded_verbatim() {
        let err = map_error(UpstreamReply {
            status: 403,
            body: Bytes::from_static(b"{\"error\":{\"code\":403}}"),
        });
        assert_eq!(err.status().as_u16(), 403);
        assert!(err.to_body_bytes().is_none());
    }

    #[test]
    fn usage_carries_quality_fields() {
        let decision = QuotaDecision {
            used: 3,
            limit: 5,
            remaining: 2,
            can_generate: true,
            is_permanent_limit: true,
            is_premium: false,
            resets_at: None,
        };
        let choice = QualityChoice {
            requested: QualityTier::Ultra,
            effective: QualityTier::Standard,
            unit_price: 0.04,
        };

        let mut out = Envelope::new();
        attach_usage(&mut out, &decision, Some(&choice)).unwrap();
        let usage = out.get("usage").unwrap();
        assert_eq!(usage.get("used").and_then(|v| v.as_u64()), Some(3));
        assert_eq!(usage.get("remaining").and_then(|v| v.as_u64()), Some(2));
        assert_eq!(usage.get("quality").and_then(|v| v.as_str()), Some("standard"));
        assert_eq!(usage.get("requestedQuality").and_then(|v| v.as_str()), Some("ultra"));
        assert!(usage.get("resetsAt").is_none());

        let mut out = Envelope::new();
        attach_usage(&mut out, &decision, None).unwrap();
        assert!(out.get("usage").unwrap().get("quality").is_none());
    }
}
