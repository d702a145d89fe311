use serde::Deserialize;

/// 客户端 `POST /generate` 请求体。未知字段（generationConfig 等）在此忽略，
/// 文本后端透传时从原始 JSON 中读取。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(default)]
    pub image_quality: Option<String>,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

impl GenerateRequest {
    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.contents.iter().flat_map(|c| c.parts.iter())
    }

    /// 所有文本 part 按顺序以换行拼接。
    pub fn prompt_text(&self) -> String {
        let texts: Vec<&str> = self
            .parts()
            .filter_map(|p| p.text.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        texts.join("\n")
    }

    pub fn first_image(&self) -> Option<&InlineData> {
        self.parts()
            .filter_map(|p| p.inline_data.as_ref())
            .find(|d| !d.data.trim().is_empty())
    }

    pub fn has_image(&self) -> bool {
        self.first_image().is_some()
    }

    pub fn has_quality_param(&self) -> bool {
        self.image_quality
            .as_deref()
            .is_some_and(|q| !q.trim().is_empty())
    }

    pub fn user_id(&self) -> &str {
        self.user_id.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_body() {
        let body = r#"{
            "userId": "u-1",
            "isPremium": true,
            "contents": [{"parts": [
                {"text": " a cat "},
                {"inlineData": {"mimeType": "image/jpeg", "data": "QUJD"}},
                {"text": "on a roof"}
            ]}],
            "imageQuality": "ultra",
            "generationConfig": {"temperature": 0.2}
        }"#;
        let req: GenerateRequest = sonic_rs::from_str(body).unwrap();
        assert_eq!(req.user_id(), "u-1");
        assert!(req.is_premium);
        assert_eq!(req.prompt_text(), "a cat\non a roof");
        assert_eq!(req.first_image().unwrap().mime_type, "image/jpeg");
        assert!(req.has_quality_param());
        assert!(req.aspect_ratio.is_none());
    }

    #[test]
    fn blank_quality_is_not_a_quality_param() {
        let req = GenerateRequest {
            image_quality: Some("  ".to_string()),
            ..GenerateRequest::default()
        };
        assert!(!req.has_quality_param());
        assert!(!req.has_image());
    }
}
