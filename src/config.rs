// 매직 넘버를 배제하고 시스템 전체의 동작을 제어하는 상수 모음입니다.
// 런타임 오버라이드는 CLI(ServerArgs)에서 주입됩니다.

use std::str::FromStr;

/// 웹소켓 시그널링 서버 TCP 포트
pub const SIGNALING_PORT: u16 = 8443;

/// 브라우저 클라이언트가 접속하는 WS 경로
pub const WS_PATH: &str = "/kurentomcu";

/// 미디어 엔진 JSON-RPC 주소
pub const ENGINE_URI: &str = "ws://localhost:8888/kurento";

/// 이 스킴으로 시작하는 engine URI는 in-process LoopbackEngine을 사용
pub const LOOPBACK_SCHEME: &str = "loopback://";

/// 브라우저 세션 식별 쿠키 이름 (발급은 앞단 웹서버 책임)
pub const SESSION_COOKIE: &str = "mcu.sid";

/// 쿠키가 없을 때 생성하는 임시 세션 id 길이
pub const ANON_SESSION_ID_LEN: usize = 24;

/// admin / trace 출력용 세션 표식 길이 (SHA-256 앞 N 바이트, hex 2N자)
pub const SESSION_TAG_BYTES: usize = 6;

/// endpoint / hub port 출력 비트레이트 상한=하한 (kbps)
pub const BIT_RATE_KBPS: u32 = 4096;

/// kbps → bps 환산 단위
pub const KILO: u32 = 1024;

/// 송신(Egress) 큐 사이즈: WS writer 태스크로 넘기는 서버 메시지 버퍼
pub const EGRESS_QUEUE_SIZE: usize = 256;

/// 커넥션 종료 시 남은 송신 큐를 흘려보내는 최대 대기 시간 (ms)
pub const EGRESS_DRAIN_TIMEOUT_MS: u64 = 500;

// ----------------------------------------------------------------------------
// [NAT 재작성 규칙]
// 엔진이 사설 주소로 candidate를 내보내는 배포 환경용.
// 원본 candidate를 먼저 보내고, 주소를 치환한 복제본을 뒤이어 보낸다.
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRewrite {
    pub from: String,
    pub to:   String,
}

impl NatRewrite {
    /// candidate 문자열에 from 주소가 있으면 치환본 반환
    pub fn apply(&self, candidate: &str) -> Option<String> {
        if candidate.contains(&self.from) {
            Some(candidate.replace(&self.from, &self.to))
        } else {
            None
        }
    }
}

impl FromStr for NatRewrite {
    type Err = String;

    /// "10.0.3.96=10.0.0.2" 형식
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s
            .split_once('=')
            .ok_or_else(|| format!("expected FROM=TO, got '{}'", s))?;
        let (from, to) = (from.trim(), to.trim());
        if from.is_empty() || to.is_empty() {
            return Err(format!("empty address in rewrite rule '{}'", s));
        }
        Ok(Self { from: from.to_string(), to: to.to_string() })
    }
}

// ----------------------------------------------------------------------------
// [미디어 설정]: 협상 시 endpoint/hub port에 적용
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub bitrate_kbps: u32,
    pub nat_rewrites: Vec<NatRewrite>,
}

impl MediaSettings {
    pub fn bitrate_bps(&self) -> u32 {
        self.bitrate_kbps.saturating_mul(KILO)
    }
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self { bitrate_kbps: BIT_RATE_KBPS, nat_rewrites: Vec::new() }
    }
}
