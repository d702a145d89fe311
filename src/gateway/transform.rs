//! 构造上游请求体。
//!
//! 图像后端：前置风格块 + 用户提示词 + 人像增强块（可选）+ 画质后缀，
//! 负面提示词由固定的中英双语词组拼接而成，完全确定、无随机性。
//! 文本后端：contents / generationConfig / safetySettings 等字段原样透传。

use crate::error::AppError;
use crate::gateway::types::GenerateRequest;
use crate::pricing::{QualityChoice, QualityTier};
use crate::upstream::selector::{BackendKind, Selection};
use crate::upstream::types::{
    OutputOptions, PredictImage, PredictInstance, PredictParameters, PredictRequest,
};
use sonic_rs::prelude::*;
use std::collections::HashMap;

pub const ALLOWED_ASPECT_RATIOS: [&str; 5] = ["1:1", "3:4", "4:3", "16:9", "9:16"];
const DEFAULT_ASPECT_RATIO: &str = "1:1";
const PORTRAIT_ASPECT_RATIO: &str = "3:4";

const STYLE_BLOCK: &str = "Create one coherent, photorealistic image. Keep subjects, lighting, scale and perspective consistent across the whole frame. Do not deform, duplicate or fuse objects; people have correct anatomy with two arms, two legs and five fingers per hand. Use a balanced composition with a clear focal point and an uncluttered background.";

const FACE_BLOCK: &str = "Face details: symmetrical, well-proportioned face, natural skin texture with pores, clear aligned eyes with matching irises and round pupils, natural lips and teeth, realistic individual hair strands.";

const STANDARD_SUFFIX: &str = "Sharp focus, fine details, natural lighting, high resolution.";

const ULTRA_SUFFIX: &str = "Ultra-detailed, 8K resolution, razor-sharp focus, intricate textures, physically accurate lighting, shadows and reflections, professional photography, maximum fidelity.";

const NEGATIVE_QUALITY: &str = "blurry, low quality, low resolution, jpeg artifacts, noise, grainy, watermark, text, signature, logo, oversaturated, overexposed, 模糊, 低质量, 低分辨率, 压缩伪影, 噪点, 水印, 文字, 签名, 标志, 过度饱和, 过曝";

const NEGATIVE_ANATOMY: &str = "deformed, distorted, disfigured, bad anatomy, bad proportions, extra limbs, missing limbs, extra fingers, missing fingers, fused fingers, mutated hands, floating limbs, 畸形, 扭曲, 解剖错误, 比例失调, 多余肢体, 缺失肢体, 多余手指, 缺失手指, 手指粘连, 变异的手, 悬空肢体";

const NEGATIVE_FACE: &str = "asymmetrical face, crossed eyes, misaligned eyes, lazy eye, deformed face, distorted facial features, extra eyes, bad teeth, melted face, 面部不对称, 斗鸡眼, 眼睛错位, 面部畸形, 五官扭曲, 多余的眼睛, 牙齿异常, 融化的脸";

/// 人像关键词。ASCII 词按整词匹配（避免 "woman" 命中 "man"），其余按子串匹配。
const PORTRAIT_KEYWORDS: [&str; 33] = [
    "portrait", "portraits", "face", "faces", "person", "persons", "people", "woman", "women",
    "man", "men", "girl", "girls", "boy", "boys", "child", "children", "selfie", "selfies",
    "headshot", "headshots", "niña", "retrato", "rostro", "cara", "persona", "mujer", "hombre",
    "人像", "肖像", "脸", "人物", "自拍",
];

/// 文本后端透传的 Gemini 字段。
const TEXT_PASSTHROUGH_FIELDS: [&str; 7] = [
    "contents",
    "generationConfig",
    "safetySettings",
    "systemInstruction",
    "tools",
    "toolConfig",
    "cachedContent",
];

pub fn is_portrait_prompt(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    PORTRAIT_KEYWORDS.iter().any(|kw| {
        if kw.is_ascii() {
            words.contains(kw)
        } else {
            lower.contains(kw)
        }
    })
}

/// 校验宽高比；不在白名单内时静默回退到默认值（人像 3:4，否则 1:1）。
pub fn resolve_aspect_ratio(requested: Option<&str>, portrait: bool) -> &'static str {
    let default = if portrait {
        PORTRAIT_ASPECT_RATIO
    } else {
        DEFAULT_ASPECT_RATIO
    };

    let Some(requested) = requested.map(str::trim).filter(|s| !s.is_empty()) else {
        return default;
    };

    match ALLOWED_ASPECT_RATIOS.iter().copied().find(|r| *r == requested) {
        Some(r) => r,
        None => {
            tracing::debug!("宽高比 {requested} 不受支持，回退为 {default}");
            default
        }
    }
}

pub fn quality_suffix(tier: QualityTier) -> Option<&'static str> {
    match tier {
        QualityTier::Fast => None,
        QualityTier::Standard => Some(STANDARD_SUFFIX),
        QualityTier::Ultra => Some(ULTRA_SUFFIX),
    }
}

pub fn augment_prompt(prompt: &str, tier: QualityTier, portrait: bool) -> String {
    let mut blocks: Vec<&str> = vec![STYLE_BLOCK, prompt.trim()];
    if portrait {
        blocks.push(FACE_BLOCK);
    }
    if let Some(suffix) = quality_suffix(tier) {
        blocks.push(suffix);
    }
    blocks.join("\n\n")
}

pub fn negative_prompt(portrait: bool) -> String {
    let mut groups = vec![NEGATIVE_QUALITY, NEGATIVE_ANATOMY];
    if portrait {
        groups.push(NEGATIVE_FACE);
    }
    groups.join(", ")
}

fn tier_parameters(tier: QualityTier) -> (bool, Option<String>) {
    match tier {
        QualityTier::Fast => (false, None),
        QualityTier::Standard => (true, None),
        QualityTier::Ultra => (true, Some("2K".to_string())),
    }
}

pub fn build_image_request(
    req: &GenerateRequest,
    choice: &QualityChoice,
) -> Result<PredictRequest, AppError> {
    let prompt = req.prompt_text();
    if prompt.is_empty() {
        return Err(AppError::bad_request("图像生成需要文本提示词"));
    }

    let portrait = is_portrait_prompt(&prompt);
    let aspect_ratio = resolve_aspect_ratio(req.aspect_ratio.as_deref(), portrait);
    let (enhance_prompt, sample_image_size) = tier_parameters(choice.effective);

    let image = req.first_image().map(|d| PredictImage {
        bytes_base64_encoded: d.data.trim().to_string(),
        mime_type: d.mime_type.trim().to_string(),
    });

    Ok(PredictRequest {
        instances: vec![PredictInstance {
            prompt: augment_prompt(&prompt, choice.effective, portrait),
            image,
        }],
        parameters: PredictParameters {
            sample_count: 1,
            aspect_ratio: aspect_ratio.to_string(),
            negative_prompt: negative_prompt(portrait),
            person_generation: "allow_adult".to_string(),
            enhance_prompt,
            sample_image_size,
            output_options: OutputOptions {
                mime_type: "image/png".to_string(),
            },
        },
    })
}

/// 从客户端原始 JSON 中挑出 Gemini 字段原样透传，丢弃 userId 等代理自有字段。
pub fn build_text_request(
    raw: &sonic_rs::Value,
) -> Result<HashMap<String, sonic_rs::Value>, AppError> {
    let Some(obj) = raw.as_object() else {
        return Err(AppError::bad_request("请求体必须是 JSON 对象"));
    };

    let mut out = HashMap::new();
    for field in TEXT_PASSTHROUGH_FIELDS {
        if let Some(v) = obj.get(&field) {
            out.insert(field.to_string(), v.clone());
        }
    }
    if !out.contains_key("contents") {
        return Err(AppError::bad_request("缺少 contents"));
    }
    Ok(out)
}

/// 按所选后端构造请求体字节。图像后端必须带上画质决策。
pub fn build(
    req: &GenerateRequest,
    raw: &sonic_rs::Value,
    selection: &Selection,
    quality: Option<&QualityChoice>,
) -> Result<Vec<u8>, AppError> {
    let bytes = match (selection.backend, quality) {
        (BackendKind::Image, Some(choice)) => sonic_rs::to_vec(&build_image_request(req, choice)?),
        (BackendKind::Image, None) => {
            return Err(AppError::Anyhow(anyhow::anyhow!("图像请求缺少画质决策")));
        }
        (BackendKind::Text, _) => sonic_rs::to_vec(&build_text_request(raw)?),
    };
    bytes.map_err(|e| AppError::Anyhow(e.into()))
}
