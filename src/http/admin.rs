// Admin REST API 핸들러 (조회 전용)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::collections::BTreeMap;

use crate::utils::current_timestamp;

use super::dto::*;
use super::state::HttpState;

/// GET /admin/status
pub async fn admin_status(State(state): State<HttpState>) -> impl IntoResponse {
    let now_ms      = current_timestamp();
    let uptime_secs = now_ms.saturating_sub(state.start_time_ms) / 1000;
    let stats       = state.mcu.stats();

    Json(ServerStatus {
        uptime_secs,
        engine:             state.mcu.engine_description(),
        participants:       stats.mixer.participants,
        session_count:      stats.sessions,
        connection_count:   stats.connections,
        pending_candidates: stats.pending_entries,
        pipeline_active:    stats.mixer.active,
        pipelines_created:  stats.mixer.created,
        pipelines_released: stats.mixer.destroyed,
        bitrate_kbps:       state.mcu.settings().bitrate_kbps,
    })
}

/// GET /admin/sessions
pub async fn admin_list_sessions(State(state): State<HttpState>) -> impl IntoResponse {
    let mut sessions: BTreeMap<String, SessionSummary> = BTreeMap::new();
    for record in state.mcu.registry.snapshot() {
        let tag = record.key.session_tag();
        let entry = sessions
            .entry(tag.clone())
            .or_insert_with(|| SessionSummary {
                session:          tag,
                connection_count: 0,
                since_ms:         record.created_at,
            });
        entry.connection_count += 1;
        entry.since_ms = entry.since_ms.min(record.created_at);
    }
    Json(sessions.into_values().collect::<Vec<_>>())
}

/// GET /admin/sessions/{session}: 경로 값은 세션 표식
pub async fn admin_get_session(
    State(state):  State<HttpState>,
    Path(session): Path<String>,
) -> impl IntoResponse {
    let records = state.mcu.registry.session_by_tag(&session);
    if records.is_empty() {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({
            "error": format!("session not found: {}", session)
        }))).into_response();
    }

    let now = current_timestamp();
    let mut connections: Vec<ConnectionInfo> = records
        .iter()
        .map(|r| ConnectionInfo {
            connection_id: r.key.connection_id.clone(),
            endpoint:      r.endpoint.to_string(),
            hub_port:      r.hub_port.to_string(),
            created_at:    r.created_at,
            active_secs:   now.saturating_sub(r.created_at) / 1000,
        })
        .collect();
    connections.sort_by_key(|c| c.created_at);

    Json(SessionDetail { session, connections }).into_response()
}
