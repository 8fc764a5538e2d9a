// HTTP 응답 DTO: mcuadmin CLI와 필드명을 공유한다

use serde::{Deserialize, Serialize};

/// GET /admin/status
#[derive(Serialize, Deserialize, Debug)]
pub struct ServerStatus {
    pub uptime_secs:        u64,
    pub engine:             String,
    pub participants:       usize,
    pub session_count:      usize,
    pub connection_count:   usize,
    /// endpoint 생성 전 candidate를 보관 중인 커넥션 수
    pub pending_candidates: usize,
    pub pipeline_active:    bool,
    pub pipelines_created:  u64,
    pub pipelines_released: u64,
    pub bitrate_kbps:       u32,
}

/// GET /admin/sessions 아이템
#[derive(Serialize, Deserialize, Debug)]
pub struct SessionSummary {
    /// 세션 표식 (쿠키 원문의 SHA-256 앞부분)
    pub session:          String,
    pub connection_count: usize,
    /// 가장 오래된 커넥션의 협상 완료 시각
    pub since_ms:         u64,
}

/// GET /admin/sessions/{session}
#[derive(Serialize, Deserialize, Debug)]
pub struct SessionDetail {
    pub session:     String,
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub endpoint:      String,
    pub hub_port:      String,
    pub created_at:    u64,
    pub active_secs:   u64,
}
