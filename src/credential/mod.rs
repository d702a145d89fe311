//! 图像后端的 Bearer 凭证来源。

pub mod oauth;
pub mod provider;
pub mod refresh_task;
pub mod types;

pub use provider::TokenProvider;
