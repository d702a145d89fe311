//! 画质档位与按预算降级策略。
//!
//! 与提示词构造解耦：只回答“请求的档位在当前预算下实际用哪一档、单价多少”。

use serde::{Deserialize, Serialize};

/// 画质档位，按“丰富程度”升序排列。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Fast,
    Standard,
    Ultra,
}

impl QualityTier {
    pub const ALL: [QualityTier; 3] = [Self::Fast, Self::Standard, Self::Ultra];

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "standard" => Some(Self::Standard),
            "ultra" => Some(Self::Ultra),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Ultra => "ultra",
        }
    }
}

/// 各档位单张生成的单价（美元）。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTable {
    pub fast: f64,
    pub standard: f64,
    pub ultra: f64,
}

impl PriceTable {
    pub fn price_of(&self, tier: QualityTier) -> f64 {
        match tier {
            QualityTier::Fast => self.fast,
            QualityTier::Standard => self.standard,
            QualityTier::Ultra => self.ultra,
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        for tier in QualityTier::ALL {
            let p = self.price_of(tier);
            if !p.is_finite() || p < 0.0 {
                return Err("单价必须是非负数");
            }
        }
        Ok(())
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            fast: crate::config::DEFAULT_PRICE_FAST_USD,
            standard: crate::config::DEFAULT_PRICE_STANDARD_USD,
            ultra: crate::config::DEFAULT_PRICE_ULTRA_USD,
        }
    }
}

/// 降级决策结果。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityChoice {
    pub requested: QualityTier,
    pub effective: QualityTier,
    pub unit_price: f64,
}

impl QualityChoice {
    pub fn downgraded(&self) -> bool {
        self.effective != self.requested
    }
}

/// 在不超过预算的档位中选最丰富、且不高于请求档位的一档。
///
/// 只降不升；若连最便宜的档位都超预算，则退到最便宜的档位。
pub fn clamp_to_budget(requested: QualityTier, prices: &PriceTable, budget: f64) -> QualityChoice {
    let within = |t: QualityTier| prices.price_of(t) <= budget + f64::EPSILON;

    let effective = QualityTier::ALL
        .iter()
        .rev()
        .copied()
        .filter(|t| *t <= requested)
        .find(|t| within(*t))
        .unwrap_or(QualityTier::Fast);

    QualityChoice {
        requested,
        effective,
        unit_price: prices.price_of(effective),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ultra_over_budget_downgrades_to_standard() {
        let choice = clamp_to_budget(QualityTier::Ultra, &PriceTable::default(), 0.04);
        assert_eq!(choice.effective, QualityTier::Standard);
        assert!(choice.downgraded());
        assert!((choice.unit_price - 0.04).abs() < 1e-9);
    }

    #[test]
    fn tier_within_budget_is_kept() {
        let choice = clamp_to_budget(QualityTier::Fast, &PriceTable::default(), 0.04);
        assert_eq!(choice.effective, QualityTier::Fast);
        assert!(!choice.downgraded());

        let choice = clamp_to_budget(QualityTier::Ultra, &PriceTable::default(), 1.0);
        assert_eq!(choice.effective, QualityTier::Ultra);
    }

    #[test]
    fn nothing_affordable_falls_back_to_cheapest() {
        let choice = clamp_to_budget(QualityTier::Ultra, &PriceTable::default(), 0.001);
        assert_eq!(choice.effective, QualityTier::Fast);
        assert!((choice.unit_price - 0.02).abs() < 1e-9);
    }

    #[test]
    fn skips_tiers_priced_above_budget() {
        let prices = PriceTable {
            fast: 0.01,
            standard: 0.05,
            ultra: 0.08,
        };
        let choice = clamp_to_budget(QualityTier::Ultra, &prices, 0.04);
        assert_eq!(choice.effective, QualityTier::Fast);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(QualityTier::parse(" ULTRA "), Some(QualityTier::Ultra));
        assert_eq!(QualityTier::parse("premium"), None);
        assert!(PriceTable::default().validate().is_ok());
        assert!(
            PriceTable {
                fast: -1.0,
                ..PriceTable::default()
            }
            .validate()
            .is_err()
        );
    }
}
