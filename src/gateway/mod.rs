//! HTTP 网关：`/generate` 流水线、请求构造、响应归一化与管理接口。

pub mod admin;
pub mod generate;
pub mod normalize;
pub mod transform;
pub mod types;

pub use generate::{AppState, handle_generate};
