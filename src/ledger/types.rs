use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// 单个用户的用量记录。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    /// 终身成功生成次数，只增不减（管理员 reset 除外）。
    pub total_used: u64,
    /// 仅供诊断：创建记录时请求携带的高级标记。
    pub is_premium_flag_at_creation: bool,
    pub daily_premium_used: u64,
    pub last_reset_day: NaiveDate,
    pub registration_timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(is_premium: bool, today: NaiveDate) -> Self {
        Self {
            total_used: 0,
            is_premium_flag_at_creation: is_premium,
            daily_premium_used: 0,
            last_reset_day: today,
            registration_timestamp: Utc::now(),
        }
    }

    /// 跨自然日时清零每日计数；同一天内多次调用不产生副作用。
    pub fn roll_day(&mut self, today: NaiveDate) -> bool {
        if self.last_reset_day == today {
            return false;
        }
        self.daily_premium_used = 0;
        self.last_reset_day = today;
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    pub free_lifetime_limit: u32,
    pub premium_daily_limit: u32,
}

impl QuotaPolicy {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            free_lifetime_limit: cfg.free_lifetime_limit,
            premium_daily_limit: cfg.premium_daily_limit,
        }
    }

    pub fn limit_for(&self, is_premium: bool) -> u64 {
        if is_premium {
            u64::from(self.premium_daily_limit)
        } else {
            u64::from(self.free_lifetime_limit)
        }
    }
}

/// 一次配额评估的结果（派生值，不落盘）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub can_generate: bool,
    /// 仅免费（终身）模式为 true。
    pub is_permanent_limit: bool,
    pub is_premium: bool,
    /// 高级模式下每日额度的下次清零时间。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
}
