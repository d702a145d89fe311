//! 用量账本（Quota Ledger）。
//!
//! 进程内、易失的按用户计数器，提供两种配额模式：
//! - 免费：终身额度，用完即永久拒绝（仅管理员 reset 可恢复）
//! - 高级：每日额度，按自然日惰性清零（评估时比较日期，无后台定时器）

mod store;
pub mod types;

pub use store::UsageLedger;
pub use types::QuotaDecision;
