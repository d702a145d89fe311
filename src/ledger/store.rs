use crate::ledger::types::{QuotaDecision, QuotaPolicy, UsageRecord};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// 用量账本：服务实例持有的唯一共享可变状态。
///
/// 单把锁保护整张表，evaluate/commit 各自是原子的读改写；
/// 但两者之间不加锁，并发请求可能同时通过 evaluate，最多超出上限 N-1 次（N 为同一用户的并发数）。
#[derive(Debug)]
pub struct UsageLedger {
    policy: QuotaPolicy,
    day_offset: FixedOffset,
    records: Mutex<HashMap<String, UsageRecord>>,
}

impl UsageLedger {
    pub fn new(policy: QuotaPolicy, day_offset: FixedOffset) -> Self {
        Self {
            policy,
            day_offset,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &crate::config::Config) -> Self {
        let offset = FixedOffset::east_opt(cfg.quota_utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix());
        Self::new(QuotaPolicy::from_config(cfg), offset)
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    /// 以配置时区计算的当前自然日。
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.day_offset).date_naive()
    }

    pub async fn evaluate(&self, user_id: &str, is_premium: bool) -> QuotaDecision {
        self.evaluate_on(user_id, is_premium, self.today()).await
    }

    /// 评估配额。唯一允许的写入：惰性创建记录、跨日清零每日计数。
    pub async fn evaluate_on(
        &self,
        user_id: &str,
        is_premium: bool,
        today: NaiveDate,
    ) -> QuotaDecision {
        let mut records = self.records.lock().await;
        let rec = records
            .entry(user_id.trim().to_string())
            .or_insert_with(|| UsageRecord::new(is_premium, today));

        if is_premium && rec.roll_day(today) {
            tracing::debug!(user_id, %today, "高级每日额度已跨日清零");
        }

        self.decide(rec, is_premium, today)
    }

    pub async fn commit(&self, user_id: &str, is_premium: bool) {
        self.commit_on(user_id, is_premium, self.today()).await;
    }

    /// 记一次成功生成。只能在上游确认成功之后调用。
    pub async fn commit_on(&self, user_id: &str, is_premium: bool, today: NaiveDate) {
        let mut records = self.records.lock().await;
        let rec = records
            .entry(user_id.trim().to_string())
            .or_insert_with(|| UsageRecord::new(is_premium, today));

        rec.total_used = rec.total_used.saturating_add(1);
        if is_premium {
            // evaluate 与 commit 之间可能跨过零点。
            rec.roll_day(today);
            rec.daily_premium_used = rec.daily_premium_used.saturating_add(1);
        }
    }

    /// 清零单个用户的全部计数，返回该用户此前是否存在。
    pub async fn reset(&self, user_id: &str) -> bool {
        let today = self.today();
        let mut records = self.records.lock().await;
        match records.get_mut(user_id.trim()) {
            Some(rec) => {
                rec.total_used = 0;
                rec.daily_premium_used = 0;
                rec.last_reset_day = today;
                true
            }
            None => false,
        }
    }

    /// 清空全部记录，返回被清除的用户数。
    pub async fn clear_all(&self) -> usize {
        let mut records = self.records.lock().await;
        let n = records.len();
        records.clear();
        n
    }

    /// 按用户 ID 排序的全量快照。
    pub async fn snapshot(&self) -> Vec<(String, UsageRecord)> {
        let records = self.records.lock().await;
        let mut out: Vec<(String, UsageRecord)> = records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn decide(&self, rec: &UsageRecord, is_premium: bool, today: NaiveDate) -> QuotaDecision {
        let limit = self.policy.limit_for(is_premium);
        let used = if is_premium {
            rec.daily_premium_used
        } else {
            rec.total_used
        };

        QuotaDecision {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            can_generate: used < limit,
            is_permanent_limit: !is_premium,
            is_premium,
            resets_at: if is_premium {
                self.next_day_start(today)
            } else {
                None
            },
        }
    }

    fn next_day_start(&self, today: NaiveDate) -> Option<DateTime<Utc>> {
        let next = today.succ_opt()?.and_hms_opt(0, 0, 0)?;
        self.day_offset
            .from_local_datetime(&next)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ledger(free: u32, premium: u32) -> UsageLedger {
        UsageLedger::new(
            QuotaPolicy {
                free_lifetime_limit: free,
                premium_daily_limit: premium,
            },
            Utc.fix(),
        )
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[tokio::test]
    async fn free_regime_is_permanently_denied_after_cap() {
        let l = ledger(5, 10);
        for _ in 0..5 {
            let d = l.evaluate_on("alice", false, day(1)).await;
            assert!(d.can_generate);
            l.commit_on("alice", false, day(1)).await;
        }

        let d = l.evaluate_on("alice", false, day(1)).await;
        assert!(!d.can_generate);
        assert!(d.is_permanent_limit);
        assert_eq!(d.used, 5);
        assert_eq!(d.remaining, 0);

        // 换日也不会恢复。
        for offset in 2..20 {
            let d = l.evaluate_on("alice", false, day(offset)).await;
            assert!(!d.can_generate);
        }

        assert!(l.reset("alice").await);
        assert!(l.evaluate_on("alice", false, day(20)).await.can_generate);
    }

    #[tokio::test]
    async fn evaluate_does_not_change_counts() {
        let l = ledger(5, 10);
        for _ in 0..50 {
            let d = l.evaluate("bob", false).await;
            assert_eq!(d.used, 0);
        }
        let snap = l.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].1.total_used, 0);
    }

    #[tokio::test]
    async fn premium_daily_counter_resets_once_per_day() {
        let l = ledger(5, 3);
        for _ in 0..3 {
            assert!(l.evaluate_on("p", true, day(1)).await.can_generate);
            l.commit_on("p", true, day(1)).await;
        }
        let d = l.evaluate_on("p", true, day(1)).await;
        assert!(!d.can_generate);
        assert!(!d.is_permanent_limit);
        assert!(d.resets_at.is_some());

        let d = l.evaluate_on("p", true, day(2)).await;
        assert!(d.can_generate);
        assert_eq!(d.used, 0);

        l.commit_on("p", true, day(2)).await;
        // 同一天内多次评估不会再次清零。
        for _ in 0..5 {
            assert_eq!(l.evaluate_on("p", true, day(2)).await.used, 1);
        }

        let snap = l.snapshot().await;
        assert_eq!(snap[0].1.total_used, 4);
        assert_eq!(snap[0].1.daily_premium_used, 1);
        assert_eq!(snap[0].1.last_reset_day, day(2));
    }

    #[tokio::test]
    async fn free_commit_does_not_touch_daily_counter() {
        let l = ledger(5, 10);
        l.commit_on("u", false, day(1)).await;
        let snap = l.snapshot().await;
        assert_eq!(snap[0].1.total_used, 1);
        assert_eq!(snap[0].1.daily_premium_used, 0);
    }

    #[tokio::test]
    async fn concurrent_commits_are_not_lost() {
        let l = Arc::new(ledger(1000, 1000));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let l = l.clone();
            handles.push(tokio::spawn(async move {
                l.commit("shared", true).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let snap = l.snapshot().await;
        assert_eq!(snap[0].1.total_used, 64);
        assert_eq!(snap[0].1.daily_premium_used, 64);
    }

    #[tokio::test]
    async fn reset_unknown_user_and_clear_all() {
        let l = ledger(5, 10);
        assert!(!l.reset("ghost").await);
        l.commit("a", false).await;
        l.commit("b", false).await;
        assert_eq!(l.clear_all().await, 2);
        assert!(l.snapshot().await.is_empty());
    }

    #[test]
    fn premium_reset_time_is_next_midnight() {
        let l = UsageLedger::new(
            QuotaPolicy {
                free_lifetime_limit: 5,
                premium_daily_limit: 10,
            },
            FixedOffset::east_opt(8 * 3600).unwrap(),
        );
        let at = l.next_day_start(day(1)).unwrap();
        assert_eq!(at.to_rfc3339(), "2026-03-01T16:00:00+00:00");
    }
}
