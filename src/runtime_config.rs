//! 运行时可动态修改的配置。
//!
//! 管理接口修改定价、预算、默认画质与日志级别后立即生效。
//! 使用 ArcSwap 实现无锁读取，写入时整体替换快照；请求路径每次只读取一份快照。

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::config::Config;
use crate::logging::LogLevel;
use crate::pricing::{PriceTable, QualityTier};

/// 运行时配置快照。
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// 调试日志级别
    pub debug: String,
    /// 请求未指定画质时使用的档位
    pub default_quality: QualityTier,
    /// 单次生成的预算上限（美元）
    pub quality_budget_usd: f64,
    pub prices: PriceTable,
}

impl RuntimeSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let default_quality =
            QualityTier::parse(&cfg.default_image_quality).unwrap_or_else(|| {
                tracing::warn!(
                    "DEFAULT_IMAGE_QUALITY={} 无效，回退为 standard",
                    cfg.default_image_quality
                );
                QualityTier::Standard
            });

        Self {
            debug: cfg.debug.clone(),
            default_quality,
            quality_budget_usd: cfg.quality_budget_usd,
            prices: PriceTable {
                fast: cfg.price_fast_usd,
                standard: cfg.price_standard_usd,
                ultra: cfg.price_ultra_usd,
            },
        }
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.debug)
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            debug: String::from("off"),
            default_quality: QualityTier::Standard,
            quality_budget_usd: crate::config::DEFAULT_QUALITY_BUDGET_USD,
            prices: PriceTable::default(),
        }
    }
}

/// 全局运行时配置存储。
static RUNTIME_SETTINGS: std::sync::OnceLock<ArcSwap<RuntimeSettings>> = std::sync::OnceLock::new();

/// 初始化运行时配置（在 main 中调用一次）。
pub fn init(cfg: &Config) {
    let settings = RuntimeSettings::from_config(cfg);
    let _ = RUNTIME_SETTINGS.set(ArcSwap::from_pointee(settings));
}

/// 获取当前运行时配置快照；未初始化时返回默认值。
pub fn get() -> Arc<RuntimeSettings> {
    RUNTIME_SETTINGS
        .get()
        .map(|s| s.load_full())
        .unwrap_or_else(|| Arc::new(RuntimeSettings::default()))
}

/// 替换运行时配置（管理接口调用）。
pub fn update(new_settings: RuntimeSettings) {
    if let Some(store) = RUNTIME_SETTINGS.get() {
        store.store(Arc::new(new_settings));
    }
}

/// 管理接口可编辑的设置（JSON 形态）。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSettings {
    pub debug: String,
    pub default_quality: String,
    pub quality_budget_usd: f64,
    pub prices: PriceTable,
}

impl AdminSettings {
    pub fn from_runtime(rt: &RuntimeSettings) -> Self {
        Self {
            debug: rt.debug.clone(),
            default_quality: rt.default_quality.as_str().to_string(),
            quality_budget_usd: rt.quality_budget_usd,
            prices: rt.prices,
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        let debug = self.debug.trim().to_lowercase();
        if !debug.is_empty() && !matches!(debug.as_str(), "off" | "low" | "medium" | "high") {
            return Err("日志级别必须是 off、low、medium 或 high");
        }
        if QualityTier::parse(&self.default_quality).is_none() {
            return Err("默认画质必须是 fast、standard 或 ultra");
        }
        if !self.quality_budget_usd.is_finite() || self.quality_budget_usd < 0.0 {
            return Err("预算必须是非负数");
        }
        self.prices.validate()
    }

    /// 应用为新的运行时快照；调用前须先 validate。
    pub fn to_runtime(&self) -> RuntimeSettings {
        let debug = self.debug.trim().to_lowercase();
        RuntimeSettings {
            debug: if debug.is_empty() { "off".to_string() } else { debug },
            default_quality: QualityTier::parse(&self.default_quality)
                .unwrap_or(QualityTier::Standard),
            quality_budget_usd: self.quality_budget_usd,
            prices: self.prices,
        }
    }
}
