// Trace SSE 스트림 핸들러
//
// GET /trace             : 전체 이벤트 스트림
// GET /trace/{session}: 특정 세션만 (session = 세션 표식)

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Sse},
};
use axum::response::sse::Event;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use super::state::HttpState;

pub async fn trace_stream(
    State(state):   State<HttpState>,
    session_filter: Option<Path<String>>,
) -> impl IntoResponse {
    let rx     = state.trace_hub.subscribe();
    let filter = session_filter.map(|Path(id)| id);

    let stream = BroadcastStream::new(rx)
        .filter_map(move |result| {
            // lagged 구간은 건너뜀
            let event = result.ok()?;
            if filter.as_deref().is_some_and(|tag| tag != event.session) {
                return None;
            }
            let json = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok::<Event, std::convert::Infallible>(Event::default().data(json)))
        });

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keep-alive"),
    )
}
