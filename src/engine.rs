// 원격 미디어 엔진 협력자 인터페이스
//
// 시그널링 계층은 엔진을 불투명한 비동기 원격 호출의 집합으로만 본다.
//   MediaEngine   : 엘리먼트 생성/연결/SDP/ICE/해제
//   EngineConnector: 엔진 접속 (프로세스당 1회, 끊기면 재접속)
//
// 구현체:
//   RpcEngine     : JSON-RPC 2.0 over WebSocket (Kurento 호환 메서드셋)
//   LoopbackEngine: in-process 엔진 (로컬 개발 / 테스트)

pub mod loopback;
pub mod rpc;

pub use loopback::{EngineOp, LoopbackConnector, LoopbackEngine};
pub use rpc::{RpcConnector, RpcEngine};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config;

// ----------------------------------------------------------------------------
// [핸들 / 타입]
// ----------------------------------------------------------------------------

/// 엔진이 발급한 원격 객체 id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Pipeline,
    Mixer,
    WebRtcEndpoint,
    HubPort,
}

impl ElementType {
    /// 엔진 측 타입 이름
    pub fn type_name(&self) -> &'static str {
        match self {
            ElementType::Pipeline       => "MediaPipeline",
            ElementType::Mixer          => "Composite",
            ElementType::WebRtcEndpoint => "WebRtcEndpoint",
            ElementType::HubPort        => "HubPort",
        }
    }
}

/// 생성 요청: 부모 객체를 함께 지정
#[derive(Debug, Clone)]
pub enum ElementSpec {
    Pipeline,
    Mixer          { pipeline: ElementId },
    WebRtcEndpoint { pipeline: ElementId },
    HubPort        { hub: ElementId },
}

impl ElementSpec {
    pub fn element_type(&self) -> ElementType {
        match self {
            ElementSpec::Pipeline              => ElementType::Pipeline,
            ElementSpec::Mixer { .. }          => ElementType::Mixer,
            ElementSpec::WebRtcEndpoint { .. } => ElementType::WebRtcEndpoint,
            ElementSpec::HubPort { .. }        => ElementType::HubPort,
        }
    }

    pub fn parent(&self) -> Option<&ElementId> {
        match self {
            ElementSpec::Pipeline                        => None,
            ElementSpec::Mixer { pipeline }
            | ElementSpec::WebRtcEndpoint { pipeline }   => Some(pipeline),
            ElementSpec::HubPort { hub }                 => Some(hub),
        }
    }
}

/// ICE candidate: 브라우저 RTCIceCandidateInit과 동일한 JSON 모양
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self { candidate: candidate.into(), sdp_mid: None, sdp_m_line_index: None }
    }
}

/// 로컬 candidate 구독 스트림. 엔진이 endpoint를 해제하면 닫힌다.
pub type CandidateRx = mpsc::UnboundedReceiver<IceCandidate>;

// ----------------------------------------------------------------------------
// [에러]
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("could not reach media engine at {uri}: {reason}")]
    Connect { uri: String, reason: String },

    #[error("engine rejected request ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected engine response: {0}")]
    Protocol(String),

    #[error("engine connection closed")]
    Closed,

    /// LoopbackEngine fault injection
    #[error("injected failure on {0}")]
    Injected(&'static str),
}

pub type EngineResult<T> = Result<T, EngineError>;

// ----------------------------------------------------------------------------
// [협력자 인터페이스]
// ----------------------------------------------------------------------------

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create(&self, spec: ElementSpec) -> EngineResult<ElementId>;

    async fn set_output_bitrate(&self, element: &ElementId, min_bps: u32, max_bps: u32) -> EngineResult<()>;

    /// source → sink 단방향 미디어 연결
    async fn connect(&self, source: &ElementId, sink: &ElementId) -> EngineResult<()>;

    async fn process_offer(&self, endpoint: &ElementId, offer: &str) -> EngineResult<String>;

    async fn gather_candidates(&self, endpoint: &ElementId) -> EngineResult<()>;

    async fn add_candidate(&self, endpoint: &ElementId, candidate: &IceCandidate) -> EngineResult<()>;

    /// endpoint가 발견하는 로컬 candidate를 계속 흘려보내는 구독 (one-shot 아님)
    async fn subscribe_candidates(&self, endpoint: &ElementId) -> EngineResult<CandidateRx>;

    async fn release(&self, element: &ElementId) -> EngineResult<()>;

    /// 캐시된 클라이언트 재사용 가능 여부
    fn is_connected(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self) -> EngineResult<Arc<dyn MediaEngine>>;

    /// 로그용 접속 대상 설명
    fn describe(&self) -> String;
}

/// engine URI → connector 선택
pub fn connector_for(uri: &str) -> Arc<dyn EngineConnector> {
    if uri.starts_with(config::LOOPBACK_SCHEME) {
        Arc::new(LoopbackConnector::new(Arc::new(LoopbackEngine::new())))
    } else {
        Arc::new(RpcConnector::new(uri))
    }
}

// ----------------------------------------------------------------------------
// [EngineHandle] 지연 접속 + 캐시
// 첫 협상 요청에서 1회 접속. 접속 실패는 해당 요청만 실패시키고 다음 요청에서 재시도.
//
// client: 마지막 클라이언트 스냅샷. 읽기/교체만 하고 다이얼 동안 잡지 않는다.
// dial  : 동시 (재)접속을 하나로 묶는 용도로만 쓴다.
// 재접속이 오래 걸려도 다른 커넥션의 candidate 전달 / teardown은 스냅샷으로 진행한다.
// ----------------------------------------------------------------------------

pub struct EngineHandle {
    connector: Arc<dyn EngineConnector>,
    client:    RwLock<Option<Arc<dyn MediaEngine>>>,
    dial:      Mutex<()>,
}

impl EngineHandle {
    pub fn new(connector: Arc<dyn EngineConnector>) -> Self {
        Self { connector, client: RwLock::new(None), dial: Mutex::new(()) }
    }

    pub async fn get(&self) -> EngineResult<Arc<dyn MediaEngine>> {
        if let Some(live) = self.live_client() {
            return Ok(live);
        }

        let _dialing = self.dial.lock().await;
        // 기다리는 동안 앞선 요청이 접속을 끝냈을 수 있다
        if let Some(live) = self.live_client() {
            return Ok(live);
        }
        if self.current().is_some() {
            warn!("[engine] cached client disconnected, reconnecting to {}", self.connector.describe());
        }

        match self.connector.connect().await {
            Ok(fresh) => {
                info!("[engine] connected to {}", self.connector.describe());
                *self.client.write().unwrap() = Some(Arc::clone(&fresh));
                Ok(fresh)
            }
            Err(e) => {
                // 끊긴 클라이언트도 그대로 둔다. teardown은 이 클라이언트로 release를 시도한다.
                warn!("[engine] could not find media engine at {}: {}", self.connector.describe(), e);
                Err(e)
            }
        }
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// 이미 연결된 클라이언트만 반환 (새로 접속하지 않음, 진행 중인 다이얼을 기다리지 않음)
    pub fn current(&self) -> Option<Arc<dyn MediaEngine>> {
        self.client.read().unwrap().clone()
    }

    fn live_client(&self) -> Option<Arc<dyn MediaEngine>> {
        self.client.read().unwrap().as_ref().filter(|c| c.is_connected()).cloned()
    }
}
