//! 上游生成后端：选择（文本/图像）、线路类型与 HTTP 客户端。

pub mod client;
pub mod selector;
pub mod types;

use crate::error::AppError;
use axum::body::Bytes;
use std::future::Future;

pub use client::UpstreamClient;
pub use selector::{AuthMode, BackendKind, Selection};

/// 上游原始应答：任何 HTTP 状态都原样交给调用方决定如何处理。
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: u16,
    pub body: Bytes,
}

impl UpstreamReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 一次上游调用。无重试、无取消传播；传输层故障直接作为错误返回。
pub trait Upstream: Send + Sync {
    fn send(
        &self,
        selection: &Selection,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<UpstreamReply, AppError>> + Send;

    /// 图像后端是否有可用的凭证来源。
    fn has_image_credentials(&self) -> bool;
}
