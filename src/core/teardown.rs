// Mcu::stop: 커넥션 종료 정리
//
// 멱등: 두 번째 호출부터는 할 일이 없다.
// 로컬 상태(큐 엔트리, record, 믹서 참조)는 원격 해제 성공 여부와 무관하게 항상 정리되고,
// 원격 해제 실패는 모아서 TeardownPartialFailure로 보고한다.

use tracing::{debug, info, warn};

use super::{ConnKey, Mcu};
use crate::error::{McuError, McuResult};

impl Mcu {
    /// 반환값: 정리한 record가 있었는지 여부
    pub async fn stop(&self, key: &ConnKey) -> McuResult<bool> {
        let dropped = self.queue.discard(key);
        if dropped > 0 {
            debug!("[teardown] discarded {} queued candidate(s) for {}", dropped, key);
        }

        let Some(record) = self.registry.remove(key) else {
            return Ok(false);
        };
        record.stop_forwarding();

        let Some(engine) = self.engine.current() else {
            // record가 있으면 엔진 접속이 있었어야 한다
            warn!("[teardown] no engine client for {}, remote elements leaked", key);
            return Err(McuError::TeardownPartialFailure {
                failed: 2,
                detail: format!("no engine client to release {} and {}", record.hub_port, record.endpoint),
            });
        };

        let mut failures = Vec::new();
        for id in [&record.hub_port, &record.endpoint] {
            if let Err(e) = engine.release(id).await {
                warn!("[teardown] release {} failed {}: {}", id, key, e);
                failures.push(format!("{}: {}", id, e));
            }
        }
        self.mixer.release(engine.as_ref()).await;

        info!("[teardown] {} released (participants={})", key, self.mixer.participants());
        if failures.is_empty() {
            Ok(true)
        } else {
            Err(McuError::TeardownPartialFailure { failed: failures.len(), detail: failures.join("; ") })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use tokio::sync::mpsc;

    use crate::config::MediaSettings;
    use crate::core::{ConnKey, Mcu, StartRequest};
    use crate::engine::{ElementType, EngineOp, IceCandidate, LoopbackConnector, LoopbackEngine};
    use crate::error::McuError;

    const OFFER: &str = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n";

    async fn joined(keys: &[ConnKey]) -> (Arc<LoopbackEngine>, Mcu) {
        let engine = Arc::new(LoopbackEngine::new());
        let mcu = Mcu::new(Arc::new(LoopbackConnector::new(Arc::clone(&engine))), MediaSettings::default());
        for key in keys {
            let (tx, _rx) = mpsc::channel(8);
            mcu.start(StartRequest { key: key.clone(), offer: OFFER.into(), outbound: tx }).await.unwrap();
        }
        (engine, mcu)
    }

    #[tokio::test]
    async fn stop_releases_leg_and_last_one_out_releases_pipeline() {
        let a = ConnKey::new("s1", "a");
        let b = ConnKey::new("s2", "b");
        let (engine, mcu) = joined(&[a.clone(), b.clone()]).await;

        assert!(mcu.stop(&a).await.unwrap());
        assert_eq!(mcu.mixer.participants(), 1);
        assert_eq!(engine.live(ElementType::Pipeline), 1);
        assert_eq!(engine.live(ElementType::WebRtcEndpoint), 1);

        assert!(mcu.stop(&b).await.unwrap());
        assert_eq!(mcu.mixer.participants(), 0);
        assert_eq!(engine.live(ElementType::Pipeline), 0);
        assert_eq!(engine.released(ElementType::Pipeline), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let a = ConnKey::new("s1", "a");
        let (engine, mcu) = joined(&[a.clone()]).await;

        assert!(mcu.stop(&a).await.unwrap());
        assert!(!mcu.stop(&a).await.unwrap());
        assert_eq!(engine.released(ElementType::Pipeline), 1);
        assert_eq!(mcu.mixer.participants(), 0);
    }

    #[tokio::test]
    async fn stop_without_record_discards_queued_candidates() {
        let (_engine, mcu) = joined(&[]).await;
        let key = ConnKey::new("s1", "ghost");
        mcu.queue.enqueue(&key, IceCandidate::new("c0"));

        assert!(!mcu.stop(&key).await.unwrap());
        assert!(!mcu.queue.contains(&key));
    }

    #[tokio::test]
    async fn remote_release_failure_still_clears_local_state() {
        let a = ConnKey::new("s1", "a");
        let (engine, mcu) = joined(&[a.clone()]).await;
        engine.fail(EngineOp::Release);

        let err = mcu.stop(&a).await.unwrap_err();
        assert!(matches!(err, McuError::TeardownPartialFailure { failed: 2, .. }));
        assert!(!mcu.registry.contains(&a));
        assert_eq!(mcu.mixer.participants(), 0);
        assert!(!mcu.mixer.stats().active);
    }
}
