// === Jemalloc 全局分配器配置（用于内存分析）===
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod config;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod pricing;
pub mod runtime_config;
pub mod upstream;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// 请求体上限：内联图片以 base64 传输，体积较大。
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cfg = config::Config::load().context("加载配置失败")?;

    init_tracing(&cfg);

    // 初始化运行时配置
    runtime_config::init(&cfg);

    let tokens = Arc::new(
        credential::TokenProvider::from_config(&cfg).context("初始化凭证提供者失败")?,
    );
    if cfg.vertex_project_id.is_empty()
        && let Some(project) = tokens.project_hint()
    {
        tracing::info!("VERTEX_PROJECT_ID 未配置，使用服务账号中的项目 {project}");
        cfg.vertex_project_id = project.to_string();
    }
    match tokens.source_kind() {
        Some(kind) => tracing::info!("图像后端凭证来源: {kind}"),
        None => tracing::warn!("未配置图像后端凭证，图像请求将返回配置错误"),
    }
    if !cfg.text_backend_ready() {
        tracing::warn!("未配置 GEMINI_API_KEY，文本请求将返回配置错误");
    }
    if cfg.admin_key.is_empty() {
        tracing::warn!("未配置 ADMIN_KEY，管理接口已禁用");
    }

    // 后台主动刷新：在 token 过期前换新，尽量避免请求路径上同步刷新。
    credential::refresh_task::spawn_token_refresh_task(tokens.clone());

    let upstream =
        upstream::UpstreamClient::new(&cfg, tokens.clone()).context("初始化上游客户端失败")?;

    let ledger = Arc::new(ledger::UsageLedger::from_config(&cfg));
    let policy = ledger.policy();
    tracing::info!(
        "配额策略：免费终身 {} 次，高级每日 {} 次，日界 UTC{:+}",
        policy.free_lifetime_limit,
        policy.premium_daily_limit,
        cfg.quota_utc_offset_hours
    );

    let state = Arc::new(gateway::AppState {
        cfg: cfg.clone(),
        ledger,
        upstream,
    });

    // === 公开路由（不需要认证）===
    let public_routes = Router::new()
        .route("/health", get(handle_health))
        .route("/debug/pprof/heap", get(handle_pprof_heap));

    // === 生成接口 ===
    let api_routes = Router::new()
        .route("/generate", post(gateway::handle_generate))
        // 兼容旧前端路径
        .route("/api/generate", post(gateway::handle_generate))
        .with_state(state.clone());

    // === 管理接口（需要 x-admin-key）===
    let admin_routes = Router::new()
        .route(
            "/admin/quota/{user_id}",
            get(gateway::admin::handle_quota_get),
        )
        .route(
            "/admin/quota/{user_id}/reset",
            post(gateway::admin::handle_quota_reset),
        )
        .route(
            "/admin/quota/clear",
            post(gateway::admin::handle_quota_clear),
        )
        .route("/admin/users", get(gateway::admin::handle_users))
        .route(
            "/admin/settings",
            get(gateway::admin::handle_settings_get).post(gateway::admin::handle_settings_post),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gateway::admin::admin_auth_middleware,
        ))
        .with_state(state.clone());

    // 组合所有路由
    let app = Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

fn init_tracing(cfg: &config::Config) {
    // DEBUG 只控制请求/响应详细日志块；依赖库日志默认压到 warn，
    // 本项目自身日志至少为 info，避免预设的 RUST_LOG=warn 把准入/降级日志过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("off")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,genproxy=info")
        } else if env.contains("genproxy") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},genproxy=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}

/// 导出 jemalloc 堆内存分析数据（pprof 格式）
/// 使用方式：
/// 1. curl http://localhost:PORT/debug/pprof/heap > heap.pb.gz
/// 2. go tool pprof -http=:8080 heap.pb.gz
#[cfg(not(target_env = "msvc"))]
async fn handle_pprof_heap() -> axum::response::Response {
    use axum::http::{StatusCode, header};
    use axum::response::IntoResponse;

    let Some(prof_ctl) = jemalloc_pprof::PROF_CTL.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "jemalloc profiling not enabled. Set MALLOC_CONF=prof:true before starting.",
        )
            .into_response();
    };

    let mut prof = prof_ctl.lock().await;
    match prof.dump_pprof() {
        Ok(pprof_data) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"heap.pb.gz\"",
                ),
            ],
            pprof_data,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to dump pprof: {e}"),
        )
            .into_response(),
    }
}

#[cfg(target_env = "msvc")]
async fn handle_pprof_heap() -> &'static str {
    "jemalloc profiling is not supported on MSVC targets"
}
