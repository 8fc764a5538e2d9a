// RpcEngine: JSON-RPC 2.0 over WebSocket 미디어 엔진 클라이언트
//
// 구조:
//   request()  ── out_tx ──▶ [writer task] ──▶ WS
//                                               │
//   pending[id] ◀── [reader task] ◀─────────────┘
//        └ oneshot 응답          └ onEvent → subscriptions[object]
//
// 메서드셋 (Kurento 호환):
//   create    { type, constructorParams }             → value: object id
//   invoke    { object, operation, operationParams }  → value
//   subscribe { type, object }                        → value: subscription id
//   release   { object }
//   onEvent   (서버 → 클라이언트 notification)
//
// 응답에 실려오는 sessionId는 이후 모든 요청에 첨부한다.

use async_trait::async_trait;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

use super::{
    CandidateRx, ElementId, ElementSpec, EngineConnector, EngineError, EngineResult,
    IceCandidate, MediaEngine,
};

/// 로컬 candidate 발견 이벤트 타입
const ICE_CANDIDATE_EVENT: &str = "IceCandidateFound";

type Pending = HashMap<u64, oneshot::Sender<EngineResult<Value>>>;

struct RpcShared {
    pending:       Mutex<Pending>,
    subscriptions: Mutex<HashMap<ElementId, mpsc::UnboundedSender<IceCandidate>>>,
    session_id:    Mutex<Option<String>>,
    closed:        AtomicBool,
}

impl RpcShared {
    /// 연결 종료: 대기 중인 요청 전부 실패 처리, 구독 스트림 닫기
    fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(EngineError::Closed));
        }
        self.subscriptions.lock().unwrap().clear();
    }

    /// 응답 대기 등록. closed 확인은 등록 뒤에 한다:
    /// shutdown의 drain보다 늦게 들어온 요청은 여기서 Closed로 끝난다.
    fn register(&self, id: u64) -> EngineResult<oneshot::Receiver<EngineResult<Value>>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        if self.closed.load(Ordering::Relaxed) {
            self.pending.lock().unwrap().remove(&id);
            return Err(EngineError::Closed);
        }
        Ok(rx)
    }

    fn dispatch(&self, text: &str) {
        let msg: Value = match serde_json::from_str(text) {
            Ok(v)  => v,
            Err(e) => {
                warn!("[engine] undecodable frame: {}", e);
                return;
            }
        };

        if msg.get("method").and_then(Value::as_str) == Some("onEvent") {
            self.on_event(&msg["params"]["value"]);
            return;
        }

        let Some(id) = msg.get("id").and_then(Value::as_u64) else {
            trace!("[engine] ignoring frame without id: {}", text);
            return;
        };
        let Some(tx) = self.pending.lock().unwrap().remove(&id) else {
            warn!("[engine] response for unknown request id={}", id);
            return;
        };

        let result = if let Some(err) = msg.get("error") {
            Err(EngineError::Rpc {
                code:    err["code"].as_i64().unwrap_or_default(),
                message: err["message"].as_str().unwrap_or("unknown error").to_string(),
            })
        } else if let Some(result) = msg.get("result") {
            if let Some(sid) = result.get("sessionId").and_then(Value::as_str) {
                *self.session_id.lock().unwrap() = Some(sid.to_string());
            }
            Ok(result.get("value").cloned().unwrap_or(Value::Null))
        } else {
            Err(EngineError::Protocol(format!("response {} has neither result nor error", id)))
        };
        let _ = tx.send(result);
    }

    fn on_event(&self, value: &Value) {
        if value["type"].as_str() != Some(ICE_CANDIDATE_EVENT) {
            trace!("[engine] unhandled event {}", value["type"]);
            return;
        }
        let Some(object) = value["object"].as_str().map(ElementId::new) else {
            return;
        };
        let candidate: IceCandidate = match serde_json::from_value(value["data"]["candidate"].clone()) {
            Ok(c)  => c,
            Err(e) => {
                warn!("[engine] malformed candidate event for {}: {}", object, e);
                return;
            }
        };

        let mut subs = self.subscriptions.lock().unwrap();
        if let Some(tx) = subs.get(&object) {
            if tx.send(candidate).is_err() {
                // 구독자(forwarder) 종료됨
                subs.remove(&object);
            }
        }
    }
}

pub struct RpcEngine {
    shared:  Arc<RpcShared>,
    out_tx:  mpsc::UnboundedSender<Message>,
    next_id: AtomicU64,
}

impl RpcEngine {
    pub async fn connect(uri: &str) -> EngineResult<Self> {
        let (ws, _) = connect_async(uri).await.map_err(|e| EngineError::Connect {
            uri:    uri.to_string(),
            reason: e.to_string(),
        })?;
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let shared = Arc::new(RpcShared {
            pending:       Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            session_id:    Mutex::new(None),
            closed:        AtomicBool::new(false),
        });

        // [writer] out_rx → WS 송신
        let writer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
            writer_shared.shutdown();
        });

        // [reader] WS 수신 → 응답/이벤트 dispatch
        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(t))  => reader_shared.dispatch(&t),
                    Ok(Message::Close(_)) => break,
                    Err(e) => { warn!("[engine] WS error: {}", e); break; }
                    _ => continue,
                }
            }
            debug!("[engine] connection closed");
            reader_shared.shutdown();
        });

        Ok(Self { shared, out_tx, next_id: AtomicU64::new(1) })
    }

    async fn request(&self, method: &str, mut params: Value) -> EngineResult<Value> {
        if let Some(sid) = self.shared.session_id.lock().unwrap().clone() {
            params["sessionId"] = Value::String(sid);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });

        let rx = self.shared.register(id)?;
        trace!("[engine] → {} id={}", method, id);

        if self.out_tx.send(Message::Text(frame.to_string().into())).is_err() {
            self.shared.pending.lock().unwrap().remove(&id);
            return Err(EngineError::Closed);
        }
        rx.await.map_err(|_| EngineError::Closed)?
    }

    async fn invoke(&self, object: &ElementId, operation: &str, operation_params: Value) -> EngineResult<Value> {
        self.request("invoke", json!({
            "object":          object,
            "operation":       operation,
            "operationParams": operation_params,
        })).await
    }
}

fn constructor_params(spec: &ElementSpec) -> Value {
    match spec {
        ElementSpec::Pipeline                    => json!({}),
        ElementSpec::Mixer { pipeline }
        | ElementSpec::WebRtcEndpoint { pipeline } => json!({ "mediaPipeline": pipeline }),
        ElementSpec::HubPort { hub }             => json!({ "hub": hub }),
    }
}

/// 엔진 쪽 IceCandidate complex type 표현
fn candidate_param(c: &IceCandidate) -> Value {
    json!({
        "__module__":    "kurento",
        "__type__":      "IceCandidate",
        "candidate":     c.candidate,
        "sdpMid":        c.sdp_mid.clone().unwrap_or_default(),
        "sdpMLineIndex": c.sdp_m_line_index.unwrap_or_default(),
    })
}

#[async_trait]
impl MediaEngine for RpcEngine {
    async fn create(&self, spec: ElementSpec) -> EngineResult<ElementId> {
        let value = self.request("create", json!({
            "type":              spec.element_type().type_name(),
            "constructorParams": constructor_params(&spec),
            "properties":        {},
        })).await?;
        value
            .as_str()
            .map(ElementId::new)
            .ok_or_else(|| EngineError::Protocol(format!("create returned non-string id: {}", value)))
    }

    async fn set_output_bitrate(&self, element: &ElementId, min_bps: u32, max_bps: u32) -> EngineResult<()> {
        self.invoke(element, "setMinOutputBitrate", json!({ "minOutputBitrate": min_bps })).await?;
        self.invoke(element, "setMaxOutputBitrate", json!({ "maxOutputBitrate": max_bps })).await?;
        Ok(())
    }

    async fn connect(&self, source: &ElementId, sink: &ElementId) -> EngineResult<()> {
        self.invoke(source, "connect", json!({ "sink": sink })).await.map(|_| ())
    }

    async fn process_offer(&self, endpoint: &ElementId, offer: &str) -> EngineResult<String> {
        let value = self.invoke(endpoint, "processOffer", json!({ "offer": offer })).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::Protocol("processOffer returned no SDP answer".into()))
    }

    async fn gather_candidates(&self, endpoint: &ElementId) -> EngineResult<()> {
        self.invoke(endpoint, "gatherCandidates", json!({})).await.map(|_| ())
    }

    async fn add_candidate(&self, endpoint: &ElementId, candidate: &IceCandidate) -> EngineResult<()> {
        self.invoke(endpoint, "addIceCandidate", json!({ "candidate": candidate_param(candidate) }))
            .await
            .map(|_| ())
    }

    async fn subscribe_candidates(&self, endpoint: &ElementId) -> EngineResult<CandidateRx> {
        // 이벤트가 subscribe 응답보다 먼저 도착할 수 있으므로 sender를 미리 등록
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscriptions.lock().unwrap().insert(endpoint.clone(), tx);

        let result = self.request("subscribe", json!({
            "type":   ICE_CANDIDATE_EVENT,
            "object": endpoint,
        })).await;

        if let Err(e) = result {
            self.shared.subscriptions.lock().unwrap().remove(endpoint);
            return Err(e);
        }
        Ok(rx)
    }

    async fn release(&self, element: &ElementId) -> EngineResult<()> {
        self.shared.subscriptions.lock().unwrap().remove(element);
        self.request("release", json!({ "object": element })).await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::Relaxed)
    }
}

// ----------------------------------------------------------------------------
// [RpcConnector]
// ----------------------------------------------------------------------------

pub struct RpcConnector {
    uri: String,
}

impl RpcConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl EngineConnector for RpcConnector {
    async fn connect(&self) -> EngineResult<Arc<dyn MediaEngine>> {
        let engine = RpcEngine::connect(&self.uri).await?;
        Ok(Arc::new(engine))
    }

    fn describe(&self) -> String {
        self.uri.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> RpcShared {
        RpcShared {
            pending:       Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            session_id:    Mutex::new(None),
            closed:        AtomicBool::new(false),
        }
    }

    #[tokio::test]
    async fn result_resolves_pending_and_records_session() {
        let s = shared();
        let (tx, rx) = oneshot::channel();
        s.pending.lock().unwrap().insert(7, tx);

        s.dispatch(r#"{"jsonrpc":"2.0","id":7,"result":{"value":"pipe_1","sessionId":"abc"}}"#);

        assert_eq!(rx.await.unwrap().unwrap(), Value::String("pipe_1".into()));
        assert_eq!(s.session_id.lock().unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn error_response_maps_to_rpc_error() {
        let s = shared();
        let (tx, rx) = oneshot::channel();
        s.pending.lock().unwrap().insert(3, tx);

        s.dispatch(r#"{"jsonrpc":"2.0","id":3,"error":{"code":40101,"message":"not found"}}"#);

        match rx.await.unwrap() {
            Err(EngineError::Rpc { code, message }) => {
                assert_eq!(code, 40101);
                assert_eq!(message, "not found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn candidate_event_routes_to_subscriber() {
        let s = shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        s.subscriptions.lock().unwrap().insert(ElementId::new("ep_1"), tx);

        s.dispatch(r#"{"jsonrpc":"2.0","method":"onEvent","params":{"value":{
            "type":"IceCandidateFound","object":"ep_1",
            "data":{"candidate":{"__module__":"kurento","__type__":"IceCandidate",
                "candidate":"candidate:1 1 UDP 1 10.0.3.96 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}}}}"#);

        let c = rx.recv().await.unwrap();
        assert!(c.candidate.contains("10.0.3.96"));
        assert_eq!(c.sdp_m_line_index, Some(0));
    }

    #[tokio::test]
    async fn shutdown_fails_pending_requests() {
        let s = shared();
        let (tx, rx) = oneshot::channel();
        s.pending.lock().unwrap().insert(1, tx);

        s.shutdown();

        assert!(matches!(rx.await.unwrap(), Err(EngineError::Closed)));
        assert!(s.closed.load(Ordering::Relaxed));
    }

    #[test]
    fn register_after_shutdown_fails_fast() {
        let s = shared();
        s.shutdown();

        assert!(matches!(s.register(5), Err(EngineError::Closed)));
        assert!(s.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn registered_request_is_failed_by_later_shutdown() {
        let s = shared();
        let rx = s.register(6).unwrap();

        s.shutdown();

        assert!(matches!(rx.await.unwrap(), Err(EngineError::Closed)));
    }

    #[test]
    fn hub_port_is_created_under_hub() {
        let params = constructor_params(&ElementSpec::HubPort { hub: ElementId::new("hub_1") });
        assert_eq!(params["hub"], "hub_1");
    }
}
