use anyhow::Context;
use figment::Figment;
use figment::providers::Env;
use serde::{Deserialize, Deserializer};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_TEXT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_IMAGE_MODEL: &str = "imagen-3.0-generate-002";
const DEFAULT_VERTEX_LOCATION: &str = "us-central1";

pub const DEFAULT_FREE_LIFETIME_LIMIT: u32 = 5;
pub const DEFAULT_PREMIUM_DAILY_LIMIT: u32 = 10;

pub const DEFAULT_QUALITY_BUDGET_USD: f64 = 0.04;
pub const DEFAULT_PRICE_FAST_USD: f64 = 0.02;
pub const DEFAULT_PRICE_STANDARD_USD: f64 = 0.04;
pub const DEFAULT_PRICE_ULTRA_USD: f64 = 0.06;
pub const DEFAULT_IMAGE_QUALITY: &str = "standard";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub timeout_ms: u64,
    pub proxy: String,
    pub debug: String,

    /// 文本后端（Gemini API Key 鉴权）
    pub gemini_api_key: String,
    pub text_model: String,

    /// 图像后端（Vertex，Bearer 鉴权）
    pub vertex_project_id: String,
    pub vertex_location: String,
    pub image_model: String,

    pub vertex_access_token: String,
    pub service_account_path: String,
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_refresh_token: String,

    pub free_lifetime_limit: u32,
    pub premium_daily_limit: u32,
    pub quota_utc_offset_hours: i32,

    pub default_image_quality: String,
    pub quality_budget_usd: f64,
    pub price_fast_usd: f64,
    pub price_standard_usd: f64,
    pub price_ultra_usd: f64,

    pub admin_key: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST", default, deserialize_with = "lenient_string")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY", default, deserialize_with = "lenient_string")]
    proxy: Option<String>,
    #[serde(alias = "DEBUG", default, deserialize_with = "lenient_string")]
    debug: Option<String>,

    #[serde(alias = "GEMINI_API_KEY", default, deserialize_with = "lenient_string")]
    gemini_api_key: Option<String>,
    #[serde(alias = "TEXT_MODEL", default, deserialize_with = "lenient_string")]
    text_model: Option<String>,

    #[serde(alias = "VERTEX_PROJECT_ID", default, deserialize_with = "lenient_string")]
    vertex_project_id: Option<String>,
    #[serde(alias = "VERTEX_LOCATION", default, deserialize_with = "lenient_string")]
    vertex_location: Option<String>,
    #[serde(alias = "IMAGE_MODEL", default, deserialize_with = "lenient_string")]
    image_model: Option<String>,

    #[serde(alias = "VERTEX_ACCESS_TOKEN", default, deserialize_with = "lenient_string")]
    vertex_access_token: Option<String>,
    #[serde(alias = "GOOGLE_APPLICATION_CREDENTIALS", default, deserialize_with = "lenient_string")]
    google_application_credentials: Option<String>,
    #[serde(alias = "GOOGLE_CLIENT_ID", default, deserialize_with = "lenient_string")]
    google_client_id: Option<String>,
    #[serde(alias = "GOOGLE_CLIENT_SECRET", default, deserialize_with = "lenient_string")]
    google_client_secret: Option<String>,
    #[serde(alias = "GOOGLE_REFRESH_TOKEN", default, deserialize_with = "lenient_string")]
    google_refresh_token: Option<String>,

    #[serde(alias = "FREE_LIFETIME_LIMIT")]
    free_lifetime_limit: Option<u32>,
    #[serde(alias = "PREMIUM_DAILY_LIMIT")]
    premium_daily_limit: Option<u32>,
    #[serde(alias = "QUOTA_UTC_OFFSET_HOURS")]
    quota_utc_offset_hours: Option<i32>,

    #[serde(alias = "DEFAULT_IMAGE_QUALITY", default, deserialize_with = "lenient_string")]
    default_image_quality: Option<String>,
    #[serde(alias = "QUALITY_BUDGET_USD")]
    quality_budget_usd: Option<f64>,
    #[serde(alias = "PRICE_FAST_USD")]
    price_fast_usd: Option<f64>,
    #[serde(alias = "PRICE_STANDARD_USD")]
    price_standard_usd: Option<f64>,
    #[serde(alias = "PRICE_ULTRA_USD")]
    price_ultra_usd: Option<f64>,

    #[serde(alias = "ADMIN_KEY", default, deserialize_with = "lenient_string")]
    admin_key: Option<String>,
}

impl Config {
    /// 读取 .env 与进程环境变量；任一键解析失败即报错，不回落到默认值。
    pub fn load() -> anyhow::Result<Self> {
        // .env 不存在时静默跳过，进程环境变量优先。
        let _ = dotenvy::dotenv();

        let mut cfg = Self::from_figment(Figment::from(Env::raw()))?;

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        Ok(cfg)
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let raw = figment
            .extract::<RawEnv>()
            .context("解析环境变量失败")?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawEnv) -> Self {
        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            gemini_api_key: trimmed(raw.gemini_api_key),
            text_model: non_empty_or(raw.text_model, DEFAULT_TEXT_MODEL),
            vertex_project_id: trimmed(raw.vertex_project_id),
            vertex_location: non_empty_or(raw.vertex_location, DEFAULT_VERTEX_LOCATION),
            image_model: non_empty_or(raw.image_model, DEFAULT_IMAGE_MODEL),
            vertex_access_token: trimmed(raw.vertex_access_token),
            service_account_path: trimmed(raw.google_application_credentials),
            google_client_id: trimmed(raw.google_client_id),
            google_client_secret: trimmed(raw.google_client_secret),
            google_refresh_token: trimmed(raw.google_refresh_token),
            free_lifetime_limit: raw
                .free_lifetime_limit
                .unwrap_or(DEFAULT_FREE_LIFETIME_LIMIT),
            premium_daily_limit: raw
                .premium_daily_limit
                .unwrap_or(DEFAULT_PREMIUM_DAILY_LIMIT),
            quota_utc_offset_hours: raw.quota_utc_offset_hours.unwrap_or(0).clamp(-12, 14),
            default_image_quality: non_empty_or(raw.default_image_quality, DEFAULT_IMAGE_QUALITY),
            quality_budget_usd: raw
                .quality_budget_usd
                .unwrap_or(DEFAULT_QUALITY_BUDGET_USD),
            price_fast_usd: raw.price_fast_usd.unwrap_or(DEFAULT_PRICE_FAST_USD),
            price_standard_usd: raw.price_standard_usd.unwrap_or(DEFAULT_PRICE_STANDARD_USD),
            price_ultra_usd: raw.price_ultra_usd.unwrap_or(DEFAULT_PRICE_ULTRA_USD),
            admin_key: trimmed(raw.admin_key),
        }
    }

    pub fn text_backend_ready(&self) -> bool {
        !self.gemini_api_key.is_empty()
    }

    pub fn has_oauth_refresh_source(&self) -> bool {
        !self.google_client_id.is_empty()
            && !self.google_client_secret.is_empty()
            && !self.google_refresh_token.is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawEnv::default())
    }
}

/// Env 会把 `DEBUG=1`、纯数字的项目号或密钥解析成数字，这里统一收回字符串。
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
        Uint(u64),
        Float(f64),
        Bool(bool),
    }

    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|v| match v {
        Scalar::Str(s) => s,
        Scalar::Int(n) => n.to_string(),
        Scalar::Uint(n) => n.to_string(),
        Scalar::Float(n) => n.to_string(),
        Scalar::Bool(b) => b.to_string(),
    }))
}

fn trimmed(v: Option<String>) -> String {
    v.map(|s| s.trim().to_string()).unwrap_or_default()
}

fn non_empty_or(v: Option<String>, default: &str) -> String {
    let v = trimmed(v);
    if v.is_empty() { default.to_string() } else { v }
}
