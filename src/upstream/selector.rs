//! 后端选择：按 (是否带图, 是否显式指定画质) 决定走文本还是图像后端，
//! 再检查该路径的凭证是否齐备。
//!
//! 图像路径一旦选定，缺凭证即报配置错误，不回退到文本后端。
//! 图像模型固定为 `IMAGE_MODEL`，画质只通过生成参数体现。

use crate::config::Config;
use crate::error::AppError;
use crate::gateway::types::GenerateRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Text,
    Image,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// 静态 API Key（x-goog-api-key）
    ApiKey,
    /// 凭证提供者换取的 Bearer token
    Bearer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub backend: BackendKind,
    pub model_id: String,
    pub auth: AuthMode,
}

/// 路由表：带图或显式画质参数 → 图像后端，否则文本后端。
pub fn route(has_image: bool, has_quality_param: bool) -> BackendKind {
    match (has_image, has_quality_param) {
        (false, false) => BackendKind::Text,
        (true, _) | (_, true) => BackendKind::Image,
    }
}

pub fn select(
    req: &GenerateRequest,
    cfg: &Config,
    image_credentials_available: bool,
) -> Result<Selection, AppError> {
    match route(req.has_image(), req.has_quality_param()) {
        BackendKind::Image => {
            if cfg.vertex_project_id.is_empty() {
                return Err(AppError::config("图像后端缺少 VERTEX_PROJECT_ID"));
            }
            if !image_credentials_available {
                return Err(AppError::config(
                    "图像后端缺少凭证（VERTEX_ACCESS_TOKEN / GOOGLE_APPLICATION_CREDENTIALS / GOOGLE_REFRESH_TOKEN）",
                ));
            }
            Ok(Selection {
                backend: BackendKind::Image,
                model_id: cfg.image_model.clone(),
                auth: AuthMode::Bearer,
            })
        }
        BackendKind::Text => {
            if !cfg.text_backend_ready() {
                return Err(AppError::config("文本后端缺少 GEMINI_API_KEY"));
            }
            Ok(Selection {
                backend: BackendKind::Text,
                model_id: cfg.text_model.clone(),
                auth: AuthMode::ApiKey,
            })
        }
    }
}
