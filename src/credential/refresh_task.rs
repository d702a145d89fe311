use crate::credential::TokenProvider;
use std::sync::Arc;
use std::time::Duration;

/// 刷新失败后的重试间隔（递增）。
const RETRY_DELAYS: [u64; 5] = [10, 30, 60, 120, 300];

/// 启动后台 token 刷新任务：按 token 实际过期时间调度，尽量避免请求路径上同步刷新。
///
/// 静态 token 或未配置凭证时不启动。
pub fn spawn_token_refresh_task(provider: Arc<TokenProvider>) {
    match provider.source_kind() {
        None | Some("static_token") => return,
        Some(kind) => tracing::info!("启动后台凭证刷新任务（{kind}）"),
    }

    tokio::spawn(async move {
        let mut failures = 0usize;
        loop {
            let sleep_duration = match provider.refresh_if_expiring().await {
                Ok(d) => {
                    failures = 0;
                    d
                }
                Err(e) => {
                    let delay = RETRY_DELAYS[failures.min(RETRY_DELAYS.len() - 1)];
                    failures += 1;
                    tracing::warn!(error = %e, "后台凭证刷新失败，{delay} 秒后重试");
                    Duration::from_secs(delay)
                }
            };

            // 至少等 1 秒，最多等 30 分钟。
            let sleep_duration = sleep_duration
                .max(Duration::from_secs(1))
                .min(Duration::from_secs(30 * 60));

            tracing::debug!("下次凭证刷新检查将在 {:?} 后", sleep_duration);
            tokio::time::sleep(sleep_duration).await;
        }
    });
}
