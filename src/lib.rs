pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod http;
pub mod protocol;
pub mod trace;
pub mod utils;

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::MediaSettings;
use crate::core::Mcu;
use crate::engine::{connector_for, EngineConnector};
use crate::http::HttpState;
use crate::protocol::{ws_handler, AppState};
use crate::trace::TraceHub;

/// CLI에서 주입되는 런타임 설정
/// - 기본값은 config.rs 상수
pub struct ServerArgs {
    pub port:           u16,
    pub ws_path:        String,
    /// `loopback://` 이면 in-process 엔진
    pub engine_uri:     String,
    pub session_cookie: String,
    pub media:          MediaSettings,
}

/// 라우터 조립. Mcu(엔진 포함)는 호출자가 만든다.
pub fn build_router(mcu: Arc<Mcu>, ws_path: &str, session_cookie: &str) -> Router {
    let trace_hub = TraceHub::new();

    let app_state = AppState {
        mcu:            Arc::clone(&mcu),
        trace_hub:      Arc::clone(&trace_hub),
        session_cookie: Arc::from(session_cookie),
    };

    let http_state = HttpState::new(Arc::clone(&mcu), Arc::clone(&trace_hub));

    let admin_router = Router::new()
        .route("/admin/status",                get(http::admin_status))
        .route("/admin/sessions",              get(http::admin_list_sessions))
        .route("/admin/sessions/{session}",    get(http::admin_get_session))
        .route("/trace",                       get(http::trace_stream))
        .route("/trace/{session}",             get(http::trace_stream))
        .with_state(http_state);

    // CORS: 운영 대시보드 로컬 접속 허용
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(ws_path, get(ws_handler))
        .with_state(app_state)
        .merge(admin_router)
        .layer(cors)
}

pub async fn run_server(args: ServerArgs) -> std::io::Result<()> {
    let connector: Arc<dyn EngineConnector> = connector_for(&args.engine_uri);
    info!("[mini-mcu] media engine: {}", connector.describe());
    for rule in &args.media.nat_rewrites {
        info!("[mini-mcu] candidate rewrite {} -> {}", rule.from, rule.to);
    }

    let mcu = Arc::new(Mcu::new(connector, args.media));
    let app = build_router(Arc::clone(&mcu), &args.ws_path, &args.session_cookie);

    let addr     = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("[mini-mcu] Signaling Server on ws://{}{}", addr, args.ws_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 남은 공유 파이프라인 정리
    mcu.shutdown().await;
    info!("[mini-mcu] bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("[mini-mcu] could not install Ctrl-C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("[mini-mcu] shutdown requested");
}
