// mcutrace: mini-mcu 실시간 시그널링 관찰 CLI
//
// 사용법:
//   mcutrace [--host HOST] [--port PORT] [--filter MSG] [SESSION_ID]
//
// 예시:
//   mcutrace                         # 전체 이벤트 스트림
//   mcutrace anon-Xy12...            # 특정 세션만
//   mcutrace --filter candidate      # candidate / iceCandidate 이벤트만

use chrono::{Local, TimeZone};
use clap::Parser;
use colored::Colorize;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::io::{BufRead, BufReader};

#[derive(Parser)]
#[command(
    name    = "mcutrace",
    about   = "mini-mcu 실시간 시그널링 이벤트 스트림 관찰",
    version,
)]
struct Cli {
    /// 서버 호스트
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// 서버 포트
    #[arg(long, default_value_t = 8443)]
    port: u16,

    /// 메시지 id 필터 (대소문자 무관, 부분 일치)
    #[arg(long, short = 'f')]
    filter: Option<String>,

    /// 관찰할 세션 표식 (mcuadmin sessions 목록 값, 생략 시 전체)
    session: Option<String>,
}

/// src/trace.rs 와 동일 구조
#[derive(Debug, Deserialize)]
struct TraceEvent {
    ts:            u64,
    dir:           String, // "in" | "out" | "sys"
    session:       String,
    connection_id: String,
    msg_id:        String,
    summary:       String,
}

fn main() {
    let cli = Cli::parse();

    let url = match &cli.session {
        Some(s) => format!("http://{}:{}/trace/{}", cli.host, cli.port, s),
        None    => format!("http://{}:{}/trace",   cli.host, cli.port),
    };
    let filter = cli.filter.as_ref().map(|s| s.to_lowercase());

    println!("{}", "─".repeat(100).dimmed());
    println!(
        "  {} {}  {}  {}",
        "mcutrace".bold().cyan(),
        "▶".green(),
        url.dimmed(),
        filter.as_deref()
            .map(|f| format!("[filter: {}]", f).yellow().to_string())
            .unwrap_or_default(),
    );
    println!("{}", "─".repeat(100).dimmed());
    println!(
        "  {:<12} {:<6} {:<14} {:<16} {:<16} {}",
        "TIME".dimmed(),
        "DIR".dimmed(),
        "MSG".dimmed(),
        "SESSION".dimmed(),
        "CONNECTION".dimmed(),
        "SUMMARY".dimmed(),
    );
    println!("{}", "─".repeat(100).dimmed());

    let client = match Client::builder().timeout(None).build() {
        Ok(c)  => c,
        Err(e) => {
            eprintln!("{} HTTP client 생성 실패: {}", "✗".red(), e);
            std::process::exit(1);
        }
    };

    let resp = match client.get(&url).header("Accept", "text/event-stream").send() {
        Ok(r)  => r,
        Err(e) => {
            eprintln!("{} 서버 연결 실패: {}", "✗".red(), e);
            eprintln!("  서버가 실행 중인지 확인하세요: {}", url.dimmed());
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        eprintln!("{} HTTP {}", "✗".red(), resp.status());
        std::process::exit(1);
    }

    let mut event_count: u64 = 0;
    for line in BufReader::new(resp).lines() {
        let line = match line {
            Ok(l)  => l,
            Err(e) => {
                eprintln!("{} 스트림 읽기 실패: {}", "✗".red(), e);
                break;
            }
        };

        // SSE: "data: {JSON}" / ": keep-alive" / 빈 줄
        let Some(json_str) = line.strip_prefix("data: ") else {
            continue;
        };

        let event: TraceEvent = match serde_json::from_str(json_str) {
            Ok(e)  => e,
            Err(e) => {
                eprintln!("{} JSON 파싱 실패: {} ({})", "⚠".yellow(), e, json_str);
                continue;
            }
        };

        if let Some(ref f) = filter {
            if !event.msg_id.to_lowercase().contains(f.as_str()) {
                continue;
            }
        }

        print_event(&event);
        event_count += 1;
    }

    println!("{}", "─".repeat(100).dimmed());
    println!("  스트림 종료 (총 {} 이벤트)", event_count);
}

fn print_event(e: &TraceEvent) {
    let dir_str = match e.dir.as_str() {
        "in"  => "↓ C→S".bright_blue().to_string(),
        "out" => "↑ S→C".bright_green().to_string(),
        "sys" => "· SYS".bright_yellow().to_string(),
        other => other.dimmed().to_string(),
    };

    println!(
        "  {} {} {:<14} {} {} {}",
        format_ts(e.ts).dimmed(),
        dir_str,
        colorize_msg(&e.msg_id),
        truncate(&e.session, 16).bright_white(),
        truncate(&e.connection_id, 16).dimmed(),
        e.summary.dimmed(),
    );
}

fn colorize_msg(msg_id: &str) -> String {
    match msg_id {
        "startResponse"            => msg_id.bright_green().bold().to_string(),
        "error" | "?"              => msg_id.bright_red().bold().to_string(),
        "start" | "stop" | "close" => msg_id.bright_cyan().to_string(),
        "candidate" | "iceCandidate" => msg_id.bright_magenta().to_string(),
        _                          => msg_id.normal().to_string(),
    }
}

/// Unix millis → 로컬 "HH:MM:SS.mmm"
fn format_ts(ts_ms: u64) -> String {
    Local
        .timestamp_millis_opt(ts_ms as i64)
        .single()
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "--:--:--.---".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        format!("{:<width$}", s, width = max)
    } else {
        let head: String = s.chars().take(max - 1).collect();
        format!("{}…", head)
    }
}
