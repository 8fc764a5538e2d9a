// Mcu::start: 커넥션 하나의 미디어 협상
//
// 순서:
//   ids 검증 → 엔진 핸들 → 공유 믹서 참조(+1)
//   → WebRtcEndpoint / HubPort 생성 + 비트레이트 상한
//   → endpoint ⇄ port 양방향 연결
//   → 로컬 candidate 구독 + forwarder 태스크
//   → processOffer
//   → registry put → gatherCandidates → 큐 flush
//
// registry put 이전 단계가 실패하면 지금까지 얻은 자원을 역순으로 되돌린다.
// (forwarder → hub port → endpoint → 믹서 참조)
// 같은 키의 record가 이미 있으면 put이 거절되고, 이때도 같은 방식으로 되돌린다.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use super::{ConnKey, ConnectionRecord, Mcu, MixHandles};
use crate::config::NatRewrite;
use crate::engine::{CandidateRx, ElementId, ElementSpec, IceCandidate, MediaEngine};
use crate::error::{McuError, McuResult};
use crate::protocol::message::ServerMessage;

/// 커넥션의 송신 채널 (rx_loop가 소켓으로 흘려보냄)
pub type OutboundTx = mpsc::Sender<ServerMessage>;

pub struct StartRequest {
    pub key:      ConnKey,
    pub offer:    String,
    pub outbound: OutboundTx,
}

/// 협상 도중 확보한 자원 (실패 시 되돌릴 대상)
#[derive(Default)]
struct Acquired {
    endpoint:  Option<ElementId>,
    hub_port:  Option<ElementId>,
    forwarder: Option<AbortHandle>,
}

impl Acquired {
    async fn rollback(self, engine: &dyn MediaEngine, key: &ConnKey) {
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
        for id in [self.hub_port, self.endpoint].into_iter().flatten() {
            if let Err(e) = engine.release(&id).await {
                warn!("[negotiate] rollback release {} failed {}: {}", id, key, e);
            }
        }
    }
}

struct MediaLeg {
    endpoint: ElementId,
    hub_port: ElementId,
    answer:   String,
}

impl Mcu {
    /// SDP offer를 받아 answer를 돌려준다. 성공 시 registry에 record가 남는다.
    pub async fn start(&self, req: StartRequest) -> McuResult<String> {
        let StartRequest { key, offer, outbound } = req;

        if !key.is_complete() {
            return Err(McuError::InvalidRequest("Cannot use undefined sessionId/websocketId".into()));
        }
        if self.registry.contains(&key) {
            return Err(already_registered(&key));
        }

        let engine = self.engine.get().await.map_err(McuError::EngineUnavailable)?;
        let mix = self.mixer.acquire(engine.as_ref()).await?;
        debug!("[negotiate] {} joined pipeline {}", key, mix.pipeline);

        let mut acquired = Acquired::default();
        let leg = match self.setup_media(engine.as_ref(), &key, &mix, &offer, outbound, &mut acquired).await {
            Ok(leg) => leg,
            Err(e) => {
                warn!("[negotiate] {} failed: {}", key, e);
                acquired.rollback(engine.as_ref(), &key).await;
                self.mixer.release(engine.as_ref()).await;
                return Err(e);
            }
        };

        let record = match self.registry.put(ConnectionRecord::new(
            key.clone(),
            leg.endpoint.clone(),
            leg.hub_port,
            acquired.forwarder.take(),
        )) {
            Ok(record) => record,
            Err(rejected) => {
                // 동시에 협상한 같은 키의 다른 커넥션이 먼저 등록됨
                rejected.stop_forwarding();
                let duplicate = Acquired {
                    endpoint:  Some(rejected.endpoint),
                    hub_port:  Some(rejected.hub_port),
                    forwarder: None,
                };
                duplicate.rollback(engine.as_ref(), &key).await;
                self.mixer.release(engine.as_ref()).await;
                return Err(already_registered(&key));
            }
        };

        let gatherer = Arc::clone(&engine);
        let endpoint = leg.endpoint;
        let gather_key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = gatherer.gather_candidates(&endpoint).await {
                warn!("[negotiate] gatherCandidates failed {}: {}", gather_key, e);
            }
        });

        let flushed = self.queue.drain_and_deliver(&key, engine.as_ref(), &record.endpoint).await;
        info!("[negotiate] {} active endpoint={} (flushed {} candidate(s))", key, record.endpoint, flushed);
        Ok(leg.answer)
    }

    async fn setup_media(
        &self,
        engine:   &dyn MediaEngine,
        key:      &ConnKey,
        mix:      &MixHandles,
        offer:    &str,
        outbound: OutboundTx,
        acquired: &mut Acquired,
    ) -> McuResult<MediaLeg> {
        let bps = self.settings.bitrate_bps();

        let endpoint = engine
            .create(ElementSpec::WebRtcEndpoint { pipeline: mix.pipeline.clone() })
            .await
            .map_err(McuError::AllocationFailed)?;
        acquired.endpoint = Some(endpoint.clone());
        apply_bitrate(engine, &endpoint, bps).await;

        let hub_port = engine
            .create(ElementSpec::HubPort { hub: mix.hub.clone() })
            .await
            .map_err(McuError::AllocationFailed)?;
        acquired.hub_port = Some(hub_port.clone());
        apply_bitrate(engine, &hub_port, bps).await;

        engine.connect(&endpoint, &hub_port).await.map_err(McuError::WiringFailed)?;
        engine.connect(&hub_port, &endpoint).await.map_err(McuError::WiringFailed)?;
        trace!("[negotiate] {} wired {} <-> {}", key, endpoint, hub_port);

        let local = engine
            .subscribe_candidates(&endpoint)
            .await
            .map_err(McuError::NegotiationFailed)?;
        acquired.forwarder = Some(spawn_forwarder(key.clone(), local, outbound, self.settings.nat_rewrites.clone()));

        let answer = engine
            .process_offer(&endpoint, offer)
            .await
            .map_err(McuError::NegotiationFailed)?;

        Ok(MediaLeg { endpoint, hub_port, answer })
    }
}

fn already_registered(key: &ConnKey) -> McuError {
    McuError::InvalidRequest(format!("connection {} already has an active media session", key.connection_id))
}

async fn apply_bitrate(engine: &dyn MediaEngine, element: &ElementId, bps: u32) {
    if let Err(e) = engine.set_output_bitrate(element, bps, bps).await {
        warn!("[negotiate] bitrate cap on {} not applied: {}", element, e);
    }
}

/// 엔진 로컬 candidate → 클라이언트 iceCandidate
/// NAT 치환 규칙에 걸리면 원본 뒤에 치환본을 하나 더 보낸다.
fn spawn_forwarder(
    key:      ConnKey,
    mut rx:   CandidateRx,
    outbound: OutboundTx,
    rewrites: Vec<NatRewrite>,
) -> AbortHandle {
    tokio::spawn(async move {
        while let Some(candidate) = rx.recv().await {
            let rewritten: Vec<IceCandidate> = rewrites
                .iter()
                .filter_map(|rule| rule.apply(&candidate.candidate))
                .map(|line| IceCandidate { candidate: line, ..candidate.clone() })
                .collect();

            for c in std::iter::once(candidate).chain(rewritten) {
                if outbound.send(ServerMessage::IceCandidate { candidate: c }).await.is_err() {
                    trace!("[ice] outbound closed, forwarder for {} stops", key);
                    return;
                }
            }
        }
        trace!("[ice] candidate stream ended for {}", key);
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaSettings;
    use crate::engine::{ElementType, EngineOp, LoopbackConnector, LoopbackEngine};
    use std::time::Duration;

    const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\ns=-\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\n";

    fn setup(settings: MediaSettings) -> (Arc<LoopbackEngine>, Mcu) {
        let engine = Arc::new(LoopbackEngine::new());
        let mcu = Mcu::new(Arc::new(LoopbackConnector::new(Arc::clone(&engine))), settings);
        (engine, mcu)
    }

    fn request(key: &ConnKey) -> (StartRequest, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (StartRequest { key: key.clone(), offer: OFFER.into(), outbound: tx }, rx)
    }

    #[tokio::test]
    async fn start_builds_wired_leg_with_bitrate_caps() {
        let (engine, mcu) = setup(MediaSettings::default());
        let key = ConnKey::new("s1", "c1");
        let (req, _rx) = request(&key);

        let answer = mcu.start(req).await.unwrap();
        assert!(answer.contains("m=video"));

        let record = mcu.registry.get(&key).unwrap();
        let links = engine.links();
        assert!(links.contains(&(record.endpoint.clone(), record.hub_port.clone())));
        assert!(links.contains(&(record.hub_port.clone(), record.endpoint.clone())));
        assert_eq!(engine.bitrate(&record.endpoint), Some((4096 * 1024, 4096 * 1024)));
        assert_eq!(engine.bitrate(&record.hub_port), Some((4096 * 1024, 4096 * 1024)));
        assert_eq!(mcu.mixer.participants(), 1);
    }

    #[tokio::test]
    async fn incomplete_key_is_rejected_before_any_side_effect() {
        let (engine, mcu) = setup(MediaSettings::default());
        let (req, _rx) = request(&ConnKey::new("s1", ""));

        let err = mcu.start(req).await.unwrap_err();
        assert!(matches!(err, McuError::InvalidRequest(_)));
        assert_eq!(engine.created(ElementType::Pipeline), 0);
        assert_eq!(mcu.mixer.participants(), 0);
    }

    #[tokio::test]
    async fn dial_failure_maps_to_engine_unavailable() {
        let (engine, mcu) = setup(MediaSettings::default());
        engine.fail(EngineOp::Dial);
        let (req, _rx) = request(&ConnKey::new("s1", "c1"));

        assert!(matches!(mcu.start(req).await, Err(McuError::EngineUnavailable(_))));
        assert_eq!(mcu.mixer.participants(), 0);
    }

    #[tokio::test]
    async fn wiring_failure_rolls_back_everything() {
        let (engine, mcu) = setup(MediaSettings::default());
        engine.fail(EngineOp::Connect);
        let key = ConnKey::new("s1", "c1");
        let (req, _rx) = request(&key);

        assert!(matches!(mcu.start(req).await, Err(McuError::WiringFailed(_))));
        assert!(!mcu.registry.contains(&key));
        assert_eq!(mcu.mixer.participants(), 0);
        assert_eq!(engine.released(ElementType::HubPort), 1);
        assert_eq!(engine.released(ElementType::WebRtcEndpoint), 1);
        assert_eq!(engine.live(ElementType::Pipeline), 0);
    }

    #[tokio::test]
    async fn rejected_offer_keeps_other_participants_untouched() {
        let (engine, mcu) = setup(MediaSettings::default());
        let first = ConnKey::new("s1", "c1");
        let (req, _rx1) = request(&first);
        mcu.start(req).await.unwrap();

        let (tx, _rx2) = mpsc::channel(4);
        let bad = StartRequest { key: ConnKey::new("s2", "c2"), offer: "not sdp".into(), outbound: tx };
        assert!(matches!(mcu.start(bad).await, Err(McuError::NegotiationFailed(_))));

        assert_eq!(mcu.mixer.participants(), 1);
        assert_eq!(engine.live(ElementType::Pipeline), 1);
        assert_eq!(engine.live(ElementType::WebRtcEndpoint), 1);
    }

    #[tokio::test]
    async fn bitrate_failure_is_not_fatal() {
        let (engine, mcu) = setup(MediaSettings::default());
        engine.fail(EngineOp::SetBitrate);
        let (req, _rx) = request(&ConnKey::new("s1", "c1"));

        assert!(mcu.start(req).await.is_ok());
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_with_nat_duplicates() {
        let settings = MediaSettings {
            nat_rewrites: vec!["127.0.0.1=203.0.113.7".parse().unwrap()],
            ..MediaSettings::default()
        };
        let (_engine, mcu) = setup(settings);
        let (req, mut rx) = request(&ConnKey::new("s1", "c1"));
        mcu.start(req).await.unwrap();

        let ServerMessage::IceCandidate { candidate: original } = rx.recv().await.unwrap() else {
            panic!("iceCandidate expected");
        };
        let ServerMessage::IceCandidate { candidate: rewritten } = rx.recv().await.unwrap() else {
            panic!("iceCandidate expected");
        };
        assert!(original.candidate.contains("127.0.0.1"));
        assert!(rewritten.candidate.contains("203.0.113.7"));
        assert_eq!(rewritten.sdp_mid, original.sdp_mid);
    }

    #[tokio::test]
    async fn same_key_started_twice_keeps_one_leg_and_balanced_count() {
        let (engine, mcu) = setup(MediaSettings::default());
        let key = ConnKey::new("sid", "same-ws-key");

        let (first, _rx1) = request(&key);
        mcu.start(first).await.unwrap();
        let (second, _rx2) = request(&key);
        assert!(matches!(mcu.start(second).await, Err(McuError::InvalidRequest(_))));
        assert_eq!(mcu.mixer.participants(), 1);
        assert_eq!(mcu.registry.count(), 1);

        assert!(mcu.stop(&key).await.unwrap());
        assert!(!mcu.stop(&key).await.unwrap());
        assert_eq!(mcu.mixer.participants(), 0);
        assert_eq!(engine.live(ElementType::Pipeline), 0);
        assert_eq!(engine.live(ElementType::WebRtcEndpoint), 0);
    }

    #[tokio::test]
    async fn concurrent_starts_on_one_key_roll_back_the_loser() {
        let engine = Arc::new(LoopbackEngine::with_latency(Duration::from_millis(10)));
        let mcu = Arc::new(Mcu::new(Arc::new(LoopbackConnector::new(Arc::clone(&engine))), MediaSettings::default()));
        let key = ConnKey::new("sid", "same-ws-key");

        let (a, _rx1) = request(&key);
        let (b, _rx2) = request(&key);
        let (ra, rb) = tokio::join!(mcu.start(a), mcu.start(b));

        assert_eq!([ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(mcu.mixer.participants(), 1);
        assert_eq!(engine.live(ElementType::WebRtcEndpoint), 1);
        assert_eq!(engine.live(ElementType::HubPort), 1);

        mcu.stop(&key).await.unwrap();
        assert_eq!(mcu.mixer.participants(), 0);
        assert_eq!(engine.live(ElementType::Pipeline), 0);
    }

    #[tokio::test]
    async fn queued_candidates_are_flushed_in_order() {
        let (engine, mcu) = setup(MediaSettings::default());
        let key = ConnKey::new("s1", "c1");
        for i in 0..3 {
            mcu.queue.enqueue(&key, IceCandidate::new(format!("c{}", i)));
        }
        let (req, _rx) = request(&key);
        mcu.start(req).await.unwrap();

        let record = mcu.registry.get(&key).unwrap();
        let got: Vec<String> = engine.remote_candidates(&record.endpoint).into_iter().map(|c| c.candidate).collect();
        assert_eq!(got, vec!["c0", "c1", "c2"]);
        assert!(!mcu.queue.contains(&key));
    }
}
