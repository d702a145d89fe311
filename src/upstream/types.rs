use serde::Serialize;

/// 图像后端 predict 请求体。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictRequest {
    pub instances: Vec<PredictInstance>,
    pub parameters: PredictParameters,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictInstance {
    pub prompt: String,
    /// 参考/编辑图；文生图时必须缺省（而不是 null）。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<PredictImage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictImage {
    pub bytes_base64_encoded: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictParameters {
    pub sample_count: u32,
    pub aspect_ratio: String,
    pub negative_prompt: String,
    pub person_generation: String,
    pub enhance_prompt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_image_size: Option<String>,
    pub output_options: OutputOptions,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputOptions {
    pub mime_type: String,
}
