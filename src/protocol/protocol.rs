use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, State},
    http::HeaderMap,
    response::Response,
};
use futures_util::{future::BoxFuture, sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config;
use crate::core::{ConnKey, Mcu, StartRequest};
use crate::engine::IceCandidate;
use crate::error::McuResult;
use crate::protocol::{
    connection::{CandidateRoute, ConnState},
    identity,
    message::{ClientMessage, ServerMessage},
};
use crate::trace::{TraceDir, TraceEvent, TraceHub};

// ----------------------------------------------------------------------------
// [공유 상태]
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub mcu:            Arc<Mcu>,
    pub trace_hub:      Arc<TraceHub>,
    /// 세션 id를 읽을 쿠키 이름
    pub session_cookie: Arc<str>,
}

// ----------------------------------------------------------------------------
// [WS 진입점]
// ----------------------------------------------------------------------------

pub async fn ws_handler(
    ws:            WebSocketUpgrade,
    headers:       HeaderMap,
    State(state):  State<AppState>,
) -> Response {
    let key = identity::resolve(&headers, &state.session_cookie);
    ws.on_upgrade(move |socket| handle_socket(socket, key, state))
}

/// 진행 중인 협상 (커넥션당 최대 1개)
type Negotiation = BoxFuture<'static, McuResult<String>>;

// ----------------------------------------------------------------------------
// [핵심] 개별 클라이언트 WS 생명주기
//
// 태스크 하나가 select!로 두 가지를 함께 기다린다:
//   - 진행 중인 협상 future
//   - 다음 수신 프레임
// 협상이 도는 동안에도 candidate / stop / close를 계속 받는다.
// ----------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, key: ConnKey, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(config::EGRESS_QUEUE_SIZE);

    info!("[ws] connected {}", key);
    state.trace_hub.publish(TraceEvent::new(TraceDir::Sys, &key, "open", "websocket connected"));

    // [rx_loop] out_rx → WS 송신
    let out_trace = Arc::clone(&state.trace_hub);
    let out_key = key.clone();
    let mut rx_loop = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            out_trace.publish(TraceEvent::new(TraceDir::Out, &out_key, msg.id(), summarize_out(&msg)));
            if ws_tx.send(Message::Text(msg.to_json().into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection { key, state: ConnState::Idle, out_tx, app: state };
    let mut negotiation: Option<Negotiation> = None;

    // [tx_loop] WS 수신 → 핸들러 dispatch
    loop {
        tokio::select! {
            result = poll_negotiation(&mut negotiation) => {
                conn.finish_negotiation(result).await;
            }
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(t)))  => t,
                    Some(Ok(Message::Close(_))) => break,
                    None                        => break,
                    Some(Err(e)) => { warn!("[ws] transport error {}: {}", conn.key, e); break; }
                    Some(Ok(_))                 => continue,
                };
                if conn.on_text(text.as_str(), &mut negotiation).await == Flow::Close {
                    break;
                }
            }
        }
    }

    conn.close(negotiation.take()).await;

    // 큐에 남은 응답(error / startResponse 등)을 보낸 뒤 writer 종료.
    // forwarder는 close에서 중단되므로 out_tx가 모두 drop되면 out_rx가 닫힌다.
    let key = conn.key.clone();
    drop(conn);
    let drain = Duration::from_millis(config::EGRESS_DRAIN_TIMEOUT_MS);
    if tokio::time::timeout(drain, &mut rx_loop).await.is_err() {
        debug!("[ws] outbound drain timed out {}", key);
        rx_loop.abort();
    }
}

/// 협상이 없으면 영원히 대기 (select! 분기 비활성화)
async fn poll_negotiation(slot: &mut Option<Negotiation>) -> McuResult<String> {
    match slot.as_mut() {
        Some(fut) => {
            let result = fut.await;
            *slot = None;
            result
        }
        None => std::future::pending().await,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

// ----------------------------------------------------------------------------
// [커넥션 상태]: 개별 WS 연결마다 보유
// ----------------------------------------------------------------------------

struct Connection {
    key:    ConnKey,
    state:  ConnState,
    out_tx: mpsc::Sender<ServerMessage>,
    app:    AppState,
}

impl Connection {
    async fn on_text(&mut self, text: &str, negotiation: &mut Option<Negotiation>) -> Flow {
        let msg = match ClientMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("[ws] {} {}", self.key, e);
                self.trace(TraceDir::In, "?", e.to_string());
                self.send(ServerMessage::error(&e)).await;
                return Flow::Continue;
            }
        };

        match msg {
            ClientMessage::Start { sdp_offer } => {
                self.trace(TraceDir::In, "start", format!("offer {} bytes", sdp_offer.len()));
                if let Err(e) = self.state.on_start() {
                    debug!("[ws] start rejected {}: {}", self.key, e);
                    self.send(ServerMessage::error(&e)).await;
                    return Flow::Continue;
                }
                let mcu = Arc::clone(&self.app.mcu);
                let req = StartRequest { key: self.key.clone(), offer: sdp_offer, outbound: self.out_tx.clone() };
                *negotiation = Some(Box::pin(async move { mcu.start(req).await }));
                Flow::Continue
            }
            ClientMessage::Candidate { candidate } => {
                self.trace(TraceDir::In, "candidate", candidate.candidate.clone());
                self.on_candidate(candidate).await;
                Flow::Continue
            }
            ClientMessage::Stop => {
                self.trace(TraceDir::In, "stop", "client stop");
                Flow::Close
            }
        }
    }

    async fn on_candidate(&self, candidate: IceCandidate) {
        match self.state.candidate_route() {
            CandidateRoute::Queue => {
                trace!("[ice] negotiating, candidate queued {}", self.key);
                self.app.mcu.queue.enqueue(&self.key, candidate);
            }
            CandidateRoute::Direct => {
                self.app.mcu.deliver_or_enqueue(&self.key, candidate).await;
            }
            CandidateRoute::Drop => {}
        }
    }

    async fn finish_negotiation(&mut self, result: McuResult<String>) {
        match result {
            Ok(answer) => {
                self.state.on_negotiated(true);
                self.send(ServerMessage::StartResponse { sdp_answer: answer }).await;
            }
            Err(e) => {
                self.state.on_negotiated(false);
                warn!("[ws] negotiation failed {}: {}", self.key, e);
                self.send(ServerMessage::error(&e)).await;
            }
        }
    }

    /// stop / close / 전송 에러 공통 종료 경로.
    /// 협상이 진행 중이면 결과를 기다린 뒤 정리한다.
    async fn close(&mut self, negotiation: Option<Negotiation>) {
        if let Some(fut) = negotiation {
            debug!("[ws] waiting for in-flight negotiation before teardown {}", self.key);
            let outcome = fut.await;
            self.state.on_negotiated(outcome.is_ok());
        }
        self.state.on_close();

        match self.app.mcu.stop(&self.key).await {
            Ok(true)  => info!("[ws] closed {}, media released", self.key),
            Ok(false) => debug!("[ws] closed {} (nothing to release)", self.key),
            Err(e)    => warn!("[ws] closed {}: {}", self.key, e),
        }
        self.trace(TraceDir::Sys, "close", format!("participants={}", self.app.mcu.mixer.participants()));
    }

    async fn send(&self, msg: ServerMessage) {
        if self.out_tx.send(msg).await.is_err() {
            trace!("[ws] outbound closed {}", self.key);
        }
    }

    fn trace(&self, dir: TraceDir, msg_id: &str, summary: impl Into<String>) {
        self.app.trace_hub.publish(TraceEvent::new(dir, &self.key, msg_id, summary));
    }
}

fn summarize_out(msg: &ServerMessage) -> String {
    match msg {
        ServerMessage::StartResponse { sdp_answer } => format!("answer {} bytes", sdp_answer.len()),
        ServerMessage::Error { message }            => message.clone(),
        ServerMessage::IceCandidate { candidate }   => candidate.candidate.clone(),
    }
}
