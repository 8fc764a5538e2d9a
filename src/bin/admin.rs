// mcuadmin: mini-mcu 운영 조회 CLI
//
// 사용법:
//   mcuadmin [--host HOST] [--port PORT] <COMMAND>
//
//   mcuadmin status                   서버 상태 요약 (참가자, 파이프라인, 대기 candidate)
//   mcuadmin sessions                 세션 전체 테이블
//   mcuadmin sessions <session>       세션 상세 (session = 목록의 세션 표식)

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use tabled::{Table, Tabled};

#[derive(Parser)]
#[command(
    name    = "mcuadmin",
    about   = "mini-mcu 운영 조회 CLI",
    version,
)]
struct Cli {
    /// 서버 호스트
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// 서버 포트 (WS/HTTP 공용)
    #[arg(long, default_value_t = 8443)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 서버 상태 요약
    Status,

    /// 세션 목록 또는 상세
    Sessions {
        /// 세션 표식 지정 시 상세 보기
        session: Option<String>,
    },
}

// ----------------------------------------------------------------------------
// [응답 타입]: http/dto.rs 와 대응
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
struct ServerStatus {
    uptime_secs:        u64,
    engine:             String,
    participants:       usize,
    session_count:      usize,
    connection_count:   usize,
    pending_candidates: usize,
    pipeline_active:    bool,
    pipelines_created:  u64,
    pipelines_released: u64,
    bitrate_kbps:       u32,
}

#[derive(Deserialize)]
struct SessionSummary {
    session:          String,
    connection_count: usize,
    since_ms:         u64,
}

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "SESSION")]
    session:     String,
    #[tabled(rename = "CONNS")]
    connections: usize,
    #[tabled(rename = "SINCE")]
    since:       String,
}

#[derive(Deserialize)]
struct SessionDetail {
    session:     String,
    connections: Vec<ConnectionInfo>,
}

#[derive(Deserialize, Tabled)]
struct ConnectionInfo {
    #[tabled(rename = "CONNECTION ID")]
    connection_id: String,
    #[tabled(rename = "ENDPOINT")]
    endpoint:      String,
    #[tabled(rename = "HUB PORT")]
    hub_port:      String,
    #[tabled(rename = "ACTIVE(s)")]
    active_secs:   u64,
}

fn main() {
    let cli = Cli::parse();
    let base = format!("http://{}:{}", cli.host, cli.port);

    let result = match &cli.command {
        Command::Status                        => cmd_status(&base),
        Command::Sessions { session: None }    => cmd_sessions(&base),
        Command::Sessions { session: Some(s) } => cmd_session_detail(&base, s),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "ERROR:".red().bold(), e);
        std::process::exit(1);
    }
}

// ----------------------------------------------------------------------------
// [커맨드 구현]
// ----------------------------------------------------------------------------

fn cmd_status(base: &str) -> Result<(), Box<dyn std::error::Error>> {
    let s: ServerStatus = get_json(&format!("{}/admin/status", base))?;

    let hours   = s.uptime_secs / 3600;
    let minutes = (s.uptime_secs % 3600) / 60;
    let secs    = s.uptime_secs % 60;

    println!();
    println!("{}", "  mini-mcu Server Status".bold().cyan());
    println!("  {}", "─".repeat(40).dimmed());
    println!("  {:20} {}", "Uptime:".bold(), format!("{}h {}m {}s", hours, minutes, secs).green());
    println!("  {:20} {}", "Engine:".bold(), s.engine);
    println!("  {:20} {}", "Participants:".bold(), s.participants.to_string().yellow());
    println!("  {:20} {}", "Sessions:".bold(),     s.session_count.to_string().yellow());
    println!("  {:20} {}", "Connections:".bold(),  s.connection_count.to_string().yellow());
    println!("  {:20} {}",
        "Pending Candidates:".bold(),
        if s.pending_candidates > 0 {
            s.pending_candidates.to_string().red().to_string()
        } else {
            s.pending_candidates.to_string().dimmed().to_string()
        }
    );
    println!("  {:20} {}",
        "Pipeline:".bold(),
        if s.pipeline_active { "● active".green().bold().to_string() } else { "○ idle".dimmed().to_string() }
    );
    println!("  {:20} {} created / {} released", "Pipeline History:".bold(), s.pipelines_created, s.pipelines_released);
    println!("  {:20} {} kbps", "Bitrate Cap:".bold(), s.bitrate_kbps);
    println!();
    Ok(())
}

fn cmd_sessions(base: &str) -> Result<(), Box<dyn std::error::Error>> {
    let sessions: Vec<SessionSummary> = get_json(&format!("{}/admin/sessions", base))?;

    if sessions.is_empty() {
        println!("{}", "  협상 완료된 세션 없음".dimmed());
        return Ok(());
    }

    let rows: Vec<SessionRow> = sessions
        .iter()
        .map(|s| SessionRow {
            session:     s.session.clone(),
            connections: s.connection_count,
            since:       format_ts(s.since_ms),
        })
        .collect();

    println!();
    println!("{}", Table::new(&rows));
    println!("  {} session(s)", rows.len());
    println!();
    Ok(())
}

fn cmd_session_detail(base: &str, session: &str) -> Result<(), Box<dyn std::error::Error>> {
    let detail: SessionDetail = get_json(&format!("{}/admin/sessions/{}", base, session))?;

    println!();
    println!("{}", format!("  Session: {}", detail.session).bold().cyan());
    println!("  {}", "─".repeat(48).dimmed());
    println!("{}", Table::new(&detail.connections).to_string()
        .lines()
        .map(|l| format!("  {}", l))
        .collect::<Vec<_>>()
        .join("\n"));
    println!("  {} connection(s)", detail.connections.len());
    println!();
    Ok(())
}

// ----------------------------------------------------------------------------
// [공통 유틸]
// ----------------------------------------------------------------------------

/// GET 요청 + JSON 역직렬화
fn get_json<T: for<'de> serde::Deserialize<'de>>(url: &str) -> Result<T, Box<dyn std::error::Error>> {
    let resp = reqwest::blocking::get(url)?;
    let status = resp.status();
    if !status.is_success() {
        let body: serde_json::Value = resp.json().unwrap_or_default();
        let msg = body["error"].as_str().unwrap_or("unknown error");
        return Err(format!("[{}] {}", status, msg).into());
    }
    Ok(resp.json()?)
}

/// Unix millis → 로컬 "YYYY-MM-DD HH:MM:SS"
fn format_ts(ms: u64) -> String {
    match Local.timestamp_millis_opt(ms as i64).single() {
        Some(t) if ms > 0 => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        _                 => "-".to_string(),
    }
}
