// LoopbackEngine: in-process 미디어 엔진
//
// 실제 미디어는 흘리지 않고 엘리먼트 그래프/SDP/ICE 시퀀스만 흉내낸다.
//   - `--engine-uri loopback://` 로 외부 엔진 없이 시그널링 동작 확인
//   - 테스트: 생성/해제 카운트, 연결 그래프, 전달된 candidate 순서 검증
//   - fail(op) 로 특정 원격 호출을 실패시켜 부분 실패 정리 경로 검증

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

use super::{
    CandidateRx, ElementId, ElementSpec, ElementType, EngineConnector, EngineError,
    EngineResult, IceCandidate, MediaEngine,
};

/// Kurento "object not found" 코드와 동일하게 맞춤
const OBJECT_NOT_FOUND: i64 = 40101;
const SDP_PARSE_ERROR:  i64 = 40208;

/// fault injection 대상 원격 호출
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Dial,
    CreatePipeline,
    CreateMixer,
    CreateEndpoint,
    CreateHubPort,
    SetBitrate,
    Connect,
    ProcessOffer,
    Subscribe,
    GatherCandidates,
    AddCandidate,
    Release,
}

impl EngineOp {
    fn name(&self) -> &'static str {
        match self {
            EngineOp::Dial             => "dial",
            EngineOp::CreatePipeline   => "create(MediaPipeline)",
            EngineOp::CreateMixer      => "create(Composite)",
            EngineOp::CreateEndpoint   => "create(WebRtcEndpoint)",
            EngineOp::CreateHubPort    => "create(HubPort)",
            EngineOp::SetBitrate       => "setOutputBitrate",
            EngineOp::Connect          => "connect",
            EngineOp::ProcessOffer     => "processOffer",
            EngineOp::Subscribe        => "subscribe",
            EngineOp::GatherCandidates => "gatherCandidates",
            EngineOp::AddCandidate     => "addIceCandidate",
            EngineOp::Release          => "release",
        }
    }

    fn create_of(ty: ElementType) -> Self {
        match ty {
            ElementType::Pipeline       => EngineOp::CreatePipeline,
            ElementType::Mixer          => EngineOp::CreateMixer,
            ElementType::WebRtcEndpoint => EngineOp::CreateEndpoint,
            ElementType::HubPort        => EngineOp::CreateHubPort,
        }
    }
}

struct Element {
    ty:     ElementType,
    parent: Option<ElementId>,
}

#[derive(Default)]
struct LoopbackState {
    next_id:     u64,
    live:        HashMap<ElementId, Element>,
    created:     HashMap<ElementType, usize>,
    released:    HashMap<ElementType, usize>,
    links:       Vec<(ElementId, ElementId)>,
    bitrates:    HashMap<ElementId, (u32, u32)>,
    remote:      HashMap<ElementId, Vec<IceCandidate>>,
    subscribers: HashMap<ElementId, mpsc::UnboundedSender<IceCandidate>>,
    failures:    HashSet<EngineOp>,
}

impl LoopbackState {
    fn check(&self, op: EngineOp) -> EngineResult<()> {
        if self.failures.contains(&op) {
            return Err(EngineError::Injected(op.name()));
        }
        Ok(())
    }

    fn expect_live(&self, id: &ElementId) -> EngineResult<ElementType> {
        self.live.get(id).map(|e| e.ty).ok_or_else(|| EngineError::Rpc {
            code:    OBJECT_NOT_FOUND,
            message: format!("object '{}' not found", id),
        })
    }

    /// id와 그 하위 엘리먼트 전부 (파이프라인 해제 시 자식도 함께 사라짐)
    fn subtree(&self, root: &ElementId) -> HashSet<ElementId> {
        let mut doomed = HashSet::from([root.clone()]);
        loop {
            let before = doomed.len();
            for (id, el) in &self.live {
                if el.parent.as_ref().is_some_and(|p| doomed.contains(p)) {
                    doomed.insert(id.clone());
                }
            }
            if doomed.len() == before {
                return doomed;
            }
        }
    }
}

pub struct LoopbackEngine {
    state:           Mutex<LoopbackState>,
    latency:         Option<Duration>,
    release_latency: Option<Duration>,
    connected:       AtomicBool,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            state:           Mutex::new(LoopbackState::default()),
            latency:         None,
            release_latency: None,
            connected:       AtomicBool::new(true),
        }
    }

    /// 엘리먼트 생성마다 지연: 동시 첫 join 경합 재현용
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency: Some(latency), ..Self::new() }
    }

    /// release마다 지연: 마지막 참가자 teardown 도중 들어오는 join 재현용
    pub fn with_release_latency(mut self, latency: Duration) -> Self {
        self.release_latency = Some(latency);
        self
    }

    pub fn fail(&self, op: EngineOp) {
        self.state.lock().unwrap().failures.insert(op);
    }

    pub fn clear_failure(&self, op: EngineOp) {
        self.state.lock().unwrap().failures.remove(&op);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// 지금까지 생성된 개수
    pub fn created(&self, ty: ElementType) -> usize {
        self.state.lock().unwrap().created.get(&ty).copied().unwrap_or(0)
    }

    /// 명시적 release 호출로 해제된 개수 (cascade 제외)
    pub fn released(&self, ty: ElementType) -> usize {
        self.state.lock().unwrap().released.get(&ty).copied().unwrap_or(0)
    }

    /// 현재 살아있는 개수
    pub fn live(&self, ty: ElementType) -> usize {
        self.state.lock().unwrap().live.values().filter(|e| e.ty == ty).count()
    }

    pub fn is_live(&self, id: &ElementId) -> bool {
        self.state.lock().unwrap().live.contains_key(id)
    }

    pub fn links(&self) -> Vec<(ElementId, ElementId)> {
        self.state.lock().unwrap().links.clone()
    }

    pub fn bitrate(&self, id: &ElementId) -> Option<(u32, u32)> {
        self.state.lock().unwrap().bitrates.get(id).copied()
    }

    /// addIceCandidate로 전달받은 원격 candidate (도착 순서)
    pub fn remote_candidates(&self, endpoint: &ElementId) -> Vec<IceCandidate> {
        self.state.lock().unwrap().remote.get(endpoint).cloned().unwrap_or_default()
    }

    /// 로컬 candidate 발견 이벤트를 강제로 발생시킨다. 구독자가 없으면 false.
    pub fn emit_candidate(&self, endpoint: &ElementId, candidate: IceCandidate) -> bool {
        let state = self.state.lock().unwrap();
        match state.subscribers.get(endpoint) {
            Some(tx) => tx.send(candidate).is_ok(),
            None     => false,
        }
    }

    async fn simulate_latency(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }

    async fn simulate_release_latency(&self) {
        if let Some(d) = self.release_latency {
            tokio::time::sleep(d).await;
        }
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create(&self, spec: ElementSpec) -> EngineResult<ElementId> {
        self.simulate_latency().await;

        let ty = spec.element_type();
        let mut state = self.state.lock().unwrap();
        state.check(EngineOp::create_of(ty))?;
        if let Some(parent) = spec.parent() {
            state.expect_live(parent)?;
        }

        state.next_id += 1;
        let id = ElementId::new(format!("loopback/{}/{}", ty.type_name(), state.next_id));
        state.live.insert(id.clone(), Element { ty, parent: spec.parent().cloned() });
        *state.created.entry(ty).or_default() += 1;
        trace!("[loopback] created {}", id);
        Ok(id)
    }

    async fn set_output_bitrate(&self, element: &ElementId, min_bps: u32, max_bps: u32) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check(EngineOp::SetBitrate)?;
        state.expect_live(element)?;
        state.bitrates.insert(element.clone(), (min_bps, max_bps));
        Ok(())
    }

    async fn connect(&self, source: &ElementId, sink: &ElementId) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check(EngineOp::Connect)?;
        state.expect_live(source)?;
        state.expect_live(sink)?;
        state.links.push((source.clone(), sink.clone()));
        Ok(())
    }

    async fn process_offer(&self, endpoint: &ElementId, offer: &str) -> EngineResult<String> {
        let state = self.state.lock().unwrap();
        state.check(EngineOp::ProcessOffer)?;
        state.expect_live(endpoint)?;
        if !offer.trim_start().starts_with("v=") {
            return Err(EngineError::Rpc { code: SDP_PARSE_ERROR, message: "invalid SDP offer".into() });
        }
        Ok(answer_for(offer))
    }

    async fn gather_candidates(&self, endpoint: &ElementId) -> EngineResult<()> {
        let state = self.state.lock().unwrap();
        state.check(EngineOp::GatherCandidates)?;
        state.expect_live(endpoint)?;
        if let Some(tx) = state.subscribers.get(endpoint) {
            let _ = tx.send(host_candidate(state.next_id));
        }
        Ok(())
    }

    async fn add_candidate(&self, endpoint: &ElementId, candidate: &IceCandidate) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check(EngineOp::AddCandidate)?;
        state.expect_live(endpoint)?;
        state.remote.entry(endpoint.clone()).or_default().push(candidate.clone());
        Ok(())
    }

    async fn subscribe_candidates(&self, endpoint: &ElementId) -> EngineResult<CandidateRx> {
        let mut state = self.state.lock().unwrap();
        state.check(EngineOp::Subscribe)?;
        state.expect_live(endpoint)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.insert(endpoint.clone(), tx);
        Ok(rx)
    }

    async fn release(&self, element: &ElementId) -> EngineResult<()> {
        self.simulate_release_latency().await;

        let mut state = self.state.lock().unwrap();
        state.check(EngineOp::Release)?;
        let ty = state.expect_live(element)?;

        let doomed = state.subtree(element);
        state.live.retain(|id, _| !doomed.contains(id));
        state.subscribers.retain(|id, _| !doomed.contains(id));
        state.links.retain(|(a, b)| !doomed.contains(a) && !doomed.contains(b));
        *state.released.entry(ty).or_default() += 1;
        trace!("[loopback] released {} ({} element(s))", element, doomed.len());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

fn host_candidate(seq: u64) -> IceCandidate {
    IceCandidate {
        candidate:        format!("candidate:{} 1 UDP 2122252543 127.0.0.1 {} typ host", seq, 40000 + seq % 20000),
        sdp_mid:          Some("0".into()),
        sdp_m_line_index: Some(0),
    }
}

/// offer의 m-line/mid를 그대로 받아 passive/sendrecv 응답을 구성
fn answer_for(offer: &str) -> String {
    let mut answer = String::from("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=loopback\r\nt=0 0\r\n");
    for line in offer.lines().map(str::trim_end) {
        if line.starts_with("m=") {
            answer.push_str(line);
            answer.push_str("\r\na=setup:passive\r\na=sendrecv\r\n");
        } else if line.starts_with("a=mid:") {
            answer.push_str(line);
            answer.push_str("\r\n");
        }
    }
    answer
}

// ----------------------------------------------------------------------------
// [LoopbackConnector]
// ----------------------------------------------------------------------------

pub struct LoopbackConnector {
    engine:       Arc<LoopbackEngine>,
    dials:        AtomicUsize,
    dial_latency: Mutex<Option<Duration>>,
}

impl LoopbackConnector {
    pub fn new(engine: Arc<LoopbackEngine>) -> Self {
        Self { engine, dials: AtomicUsize::new(0), dial_latency: Mutex::new(None) }
    }

    /// 접속마다 지연: 느린 (재)접속 재현용
    pub fn with_dial_latency(engine: Arc<LoopbackEngine>, latency: Duration) -> Self {
        let connector = Self::new(engine);
        connector.set_dial_latency(latency);
        connector
    }

    pub fn set_dial_latency(&self, latency: Duration) {
        *self.dial_latency.lock().unwrap() = Some(latency);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EngineConnector for LoopbackConnector {
    async fn connect(&self) -> EngineResult<Arc<dyn MediaEngine>> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        let latency = *self.dial_latency.lock().unwrap();
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        self.engine.state.lock().unwrap().check(EngineOp::Dial)?;
        self.engine.set_connected(true);
        Ok(Arc::clone(&self.engine) as Arc<dyn MediaEngine>)
    }

    fn describe(&self) -> String {
        "loopback (in-process)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n";

    #[tokio::test]
    async fn releasing_pipeline_cascades_to_children() {
        let engine   = LoopbackEngine::new();
        let pipeline = engine.create(ElementSpec::Pipeline).await.unwrap();
        let hub      = engine.create(ElementSpec::Mixer { pipeline: pipeline.clone() }).await.unwrap();
        let port     = engine.create(ElementSpec::HubPort { hub: hub.clone() }).await.unwrap();

        engine.release(&pipeline).await.unwrap();

        assert!(!engine.is_live(&hub));
        assert!(!engine.is_live(&port));
        assert_eq!(engine.released(ElementType::Pipeline), 1);
        assert_eq!(engine.released(ElementType::Mixer), 0);
    }

    #[tokio::test]
    async fn create_under_missing_parent_fails() {
        let engine = LoopbackEngine::new();
        let err = engine
            .create(ElementSpec::HubPort { hub: ElementId::new("nope") })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Rpc { code: OBJECT_NOT_FOUND, .. }));
    }

    #[tokio::test]
    async fn injected_failure_hits_only_that_op() {
        let engine = LoopbackEngine::new();
        engine.fail(EngineOp::CreateMixer);
        let pipeline = engine.create(ElementSpec::Pipeline).await.unwrap();
        assert!(engine.create(ElementSpec::Mixer { pipeline }).await.is_err());
        assert_eq!(engine.created(ElementType::Mixer), 0);
    }

    #[tokio::test]
    async fn answer_mirrors_offer_media_sections() {
        let engine   = LoopbackEngine::new();
        let pipeline = engine.create(ElementSpec::Pipeline).await.unwrap();
        let ep       = engine.create(ElementSpec::WebRtcEndpoint { pipeline }).await.unwrap();

        let answer = engine.process_offer(&ep, OFFER).await.unwrap();
        assert!(answer.starts_with("v=0"));
        assert!(answer.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111"));
        assert!(answer.contains("a=setup:passive"));

        assert!(engine.process_offer(&ep, "garbage").await.is_err());
    }

    #[tokio::test]
    async fn release_latency_delays_removal() {
        let engine   = LoopbackEngine::new().with_release_latency(Duration::from_millis(30));
        let pipeline = engine.create(ElementSpec::Pipeline).await.unwrap();

        let started = std::time::Instant::now();
        engine.release(&pipeline).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!engine.is_live(&pipeline));
    }

    #[tokio::test]
    async fn gather_pushes_candidate_to_subscriber_until_release() {
        let engine   = LoopbackEngine::new();
        let pipeline = engine.create(ElementSpec::Pipeline).await.unwrap();
        let ep       = engine.create(ElementSpec::WebRtcEndpoint { pipeline }).await.unwrap();

        let mut rx = engine.subscribe_candidates(&ep).await.unwrap();
        engine.gather_candidates(&ep).await.unwrap();
        let c = rx.recv().await.unwrap();
        assert!(c.candidate.contains("typ host"));

        engine.release(&ep).await.unwrap();
        assert!(rx.recv().await.is_none(), "release 후 구독 스트림이 닫혀야 합니다.");
    }
}
