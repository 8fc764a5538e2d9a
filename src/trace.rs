// TraceHub: 시그널링 이벤트 실시간 관찰 버스
//
// 구조:
//   커넥션 핸들러(protocol.rs)
//       └── TraceHub::publish(event)
//               └── broadcast::Sender
//                       ├── SSE subscriber (mcutrace 프로세스 1)
//                       └── SSE subscriber (mcutrace 프로세스 2)
//
// 구독자가 없으면 publish는 그냥 drop.
// 구독자가 느리면 lagged: 구독자 쪽에서 처리.

use std::sync::Arc;
use tokio::sync::broadcast;
use serde::Serialize;

use crate::core::ConnKey;
use crate::utils::current_timestamp;

/// 구독자가 느릴 때 최대 보유 이벤트 수
const TRACE_BUF: usize = 512;

/// 이벤트 방향
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TraceDir {
    /// 클라이언트 → 서버
    In,
    /// 서버 → 클라이언트
    Out,
    /// 서버 내부 (협상 완료, teardown 등)
    Sys,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// Unix millis
    pub ts:            u64,
    pub dir:           TraceDir,
    /// 세션 표식 (ConnKey::session_tag), 쿠키 원문 아님
    pub session:       String,
    pub connection_id: String,
    /// 메시지 id (start / candidate / startResponse ...)
    pub msg_id:        String,
    pub summary:       String,
}

impl TraceEvent {
    pub fn new(dir: TraceDir, key: &ConnKey, msg_id: &str, summary: impl Into<String>) -> Self {
        Self {
            ts:            current_timestamp(),
            dir,
            session:       key.session_tag(),
            connection_id: key.connection_id.clone(),
            msg_id:        msg_id.to_string(),
            summary:       summary.into(),
        }
    }
}

pub struct TraceHub {
    tx: broadcast::Sender<TraceEvent>,
}

impl TraceHub {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(TRACE_BUF);
        Arc::new(Self { tx })
    }

    pub fn publish(&self, event: TraceEvent) {
        // 구독자 없음은 정상
        let _ = self.tx.send(event);
    }

    /// SSE 연결마다 호출
    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConnKey {
        ConnKey::new("sess", "conn")
    }

    #[test]
    fn publish_without_subscriber_no_panic() {
        let hub = TraceHub::new();
        hub.publish(TraceEvent::new(TraceDir::Sys, &key(), "stop", "no subscriber"));
    }

    #[tokio::test]
    async fn subscribe_receives_event() {
        let hub = TraceHub::new();
        let mut rx = hub.subscribe();

        hub.publish(TraceEvent::new(TraceDir::In, &key(), "start", "offer 120 bytes"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.dir, TraceDir::In);
        assert_eq!(event.session, key().session_tag());
        assert_eq!(event.connection_id, "conn");
        assert_eq!(event.msg_id, "start");
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let hub = TraceHub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        hub.publish(TraceEvent::new(TraceDir::Out, &key(), "startResponse", "answer"));

        assert_eq!(rx1.recv().await.unwrap().msg_id, "startResponse");
        assert_eq!(rx2.recv().await.unwrap().msg_id, "startResponse");
    }

    #[test]
    fn trace_event_serializes_to_json() {
        let json = serde_json::to_string(&TraceEvent::new(TraceDir::Sys, &key(), "stop", "bye")).unwrap();
        assert!(json.contains("\"dir\":\"sys\""));
        assert!(json.contains("\"msg_id\":\"stop\""));
        assert!(!json.contains("sess\""), "쿠키 원문이 이벤트에 실리면 안 됩니다.");
    }
}
