// HTTP 운영 API
//
// GET /admin/status                 → 서버 상태 요약
// GET /admin/sessions               → 세션 목록
// GET /admin/sessions/{session}     → 세션 상세 (커넥션별 endpoint / hub port)
// GET /trace                        → 시그널링 이벤트 SSE
// GET /trace/{session}              → 특정 세션만

pub mod admin;
pub mod dto;
pub mod state;
pub mod trace;

pub use admin::{admin_get_session, admin_list_sessions, admin_status};
pub use state::HttpState;
pub use trace::trace_stream;
