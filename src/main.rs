use clap::Parser;
use tracing_subscriber::EnvFilter;

use mini_mcu::config::{self, MediaSettings, NatRewrite};
use mini_mcu::{run_server, ServerArgs};

#[derive(Parser)]
#[command(
    name    = "mcuserver",
    about   = "mini-mcu 시그널링 서버 (WebRTC 다자간 믹싱)",
    version,
)]
struct Cli {
    /// WS/HTTP 리슨 포트
    #[arg(long, default_value_t = config::SIGNALING_PORT)]
    port: u16,

    /// 브라우저가 접속하는 WebSocket 경로
    #[arg(long, default_value = config::WS_PATH)]
    ws_path: String,

    /// 미디어 엔진 주소 (loopback:// 이면 in-process 엔진)
    #[arg(long, default_value = config::ENGINE_URI)]
    engine_uri: String,

    /// 세션 id를 읽을 쿠키 이름
    #[arg(long, default_value = config::SESSION_COOKIE)]
    session_cookie: String,

    /// endpoint / hub port 출력 비트레이트 (kbps)
    #[arg(long, default_value_t = config::BIT_RATE_KBPS)]
    bitrate_kbps: u32,

    /// candidate 주소 치환 규칙 FROM=TO (반복 지정 가능)
    #[arg(long = "nat-rewrite", value_name = "FROM=TO")]
    nat_rewrites: Vec<NatRewrite>,
}

#[tokio::main]
async fn main() {
    // RUST_LOG 우선, 없으면 info
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let args = ServerArgs {
        port:           cli.port,
        ws_path:        cli.ws_path,
        engine_uri:     cli.engine_uri,
        session_cookie: cli.session_cookie,
        media:          MediaSettings { bitrate_kbps: cli.bitrate_kbps, nat_rewrites: cli.nat_rewrites },
    };

    if let Err(e) = run_server(args).await {
        tracing::error!("[mini-mcu] server error: {}", e);
        std::process::exit(1);
    }
}
