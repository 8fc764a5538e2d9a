// HttpState: HTTP 핸들러 공유 상태

use std::sync::Arc;

use crate::core::Mcu;
use crate::trace::TraceHub;
use crate::utils::current_timestamp;

#[derive(Clone)]
pub struct HttpState {
    pub mcu:           Arc<Mcu>,
    pub trace_hub:     Arc<TraceHub>,
    /// 서버 프로세스 시작 시각 (Unix millis)
    pub start_time_ms: u64,
}

impl HttpState {
    pub fn new(mcu: Arc<Mcu>, trace_hub: Arc<TraceHub>) -> Self {
        Self { mcu, trace_hub, start_time_ms: current_timestamp() }
    }
}
