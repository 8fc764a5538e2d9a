// 네트워크 로직과 분리된 세션/공유 자원 상태 관리 모듈입니다.
//
//   CandidateQueue: endpoint 생성 전에 도착한 ICE candidate 버퍼
//   SharedMixer   : 단일 파이프라인 + 믹서, 참가자 수 기반 수명 관리
//   SessionRegistry: (session, connection) → ConnectionRecord
//   Mcu           : 위 구성요소를 묶은 컨텍스트 (협상 / 해제 오케스트레이션)

pub mod candidate_queue;
pub mod mcu;
pub mod mixer;
pub mod negotiate;
pub mod registry;
pub mod teardown;

pub use candidate_queue::CandidateQueue;
pub use mcu::{Delivery, Mcu, McuStats};
pub use mixer::{MixHandles, MixerStats, SharedMixer};
pub use negotiate::{OutboundTx, StartRequest};
pub use registry::{ConnectionRecord, SessionRegistry};

use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::SESSION_TAG_BYTES;

/// 브라우저 세션(쿠키) 안의 개별 WS 커넥션 식별 키
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub session_id:    String,
    pub connection_id: String,
}

impl ConnKey {
    pub fn new(session_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self { session_id: session_id.into(), connection_id: connection_id.into() }
    }

    pub fn is_complete(&self) -> bool {
        !self.session_id.is_empty() && !self.connection_id.is_empty()
    }

    pub fn session_tag(&self) -> String {
        session_tag(&self.session_id)
    }
}

/// 외부(admin / trace)에 보여주는 세션 표식. 쿠키 원문은 세션 토큰이므로 노출하지 않는다.
pub fn session_tag(session_id: &str) -> String {
    Sha256::digest(session_id.as_bytes())
        .iter()
        .take(SESSION_TAG_BYTES)
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.session_id, self.connection_id)
    }
}
