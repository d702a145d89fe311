use crate::config::Config;
use crate::credential::TokenProvider;
use crate::error::AppError;
use crate::logging;
use crate::runtime_config;
use crate::upstream::selector::{AuthMode, BackendKind, Selection};
use crate::upstream::{Upstream, UpstreamReply};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::{Duration, Instant};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-goog-api-key");

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    api_key: String,
    project_id: String,
    location: String,
    tokens: Arc<TokenProvider>,
}

impl UpstreamClient {
    pub fn new(cfg: &Config, tokens: Arc<TokenProvider>) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            api_key: cfg.gemini_api_key.clone(),
            project_id: cfg.vertex_project_id.clone(),
            location: cfg.vertex_location.clone(),
            tokens,
        })
    }

    pub fn url_for(&self, selection: &Selection) -> String {
        match selection.backend {
            BackendKind::Text => format!(
                "{GEMINI_API_BASE}/models/{}:generateContent",
                selection.model_id
            ),
            BackendKind::Image => format!(
                "https://{loc}-aiplatform.googleapis.com/v1/projects/{project}/locations/{loc}/publishers/google/models/{model}:predict",
                loc = self.location,
                project = self.project_id,
                model = selection.model_id,
            ),
        }
    }

    async fn build_headers(&self, auth: AuthMode) -> Result<HeaderMap, AppError> {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match auth {
            AuthMode::ApiKey => {
                let v = HeaderValue::from_str(&self.api_key)
                    .map_err(|_| AppError::config("GEMINI_API_KEY 含非法字符"))?;
                h.insert(API_KEY_HEADER, v);
            }
            AuthMode::Bearer => {
                let token = self.tokens.access_token().await?;
                let v = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| AppError::authentication("access_token 含非法字符"))?;
                h.insert(AUTHORIZATION, v);
            }
        }
        Ok(h)
    }
}

impl Upstream for UpstreamClient {
    async fn send(&self, selection: &Selection, body: Vec<u8>) -> Result<UpstreamReply, AppError> {
        let url = self.url_for(selection);
        let headers = self.build_headers(selection.auth).await?;
        let log_level = runtime_config::get().log_level();

        logging::backend_request(log_level, "POST", &url, &headers, &body);
        tracing::info!(
            backend = selection.backend.as_str(),
            model = %selection.model_id,
            "转发到上游"
        );

        let start = Instant::now();
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::backend(e.to_string()))?;

        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AppError::backend(e.to_string()))?;

        logging::backend_response(log_level, status, start.elapsed(), &bytes);

        Ok(UpstreamReply {
            status,
            body: bytes,
        })
    }

    fn has_image_credentials(&self) -> bool {
        self.tokens.has_source()
    }
}
