// 커넥션 식별
//   session_id   : 브라우저 세션 쿠키 (읽기만 함, 발급은 범위 밖)
//   connection_id: WebSocket 핸드셰이크의 Sec-WebSocket-Key + 프로세스 내 일련번호
// 둘 중 없는 값은 커넥션마다 임의 토큰으로 채운다.
// Sec-WebSocket-Key는 클라이언트가 고르는 값이라 소켓 두 개가 같은 값을 보낼 수 있다.
// 일련번호를 붙여 소켓마다 다른 키가 되게 한다.

use axum::http::{header, HeaderMap};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ANON_SESSION_ID_LEN;
use crate::core::ConnKey;
use crate::utils::random_token;

static CONN_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn resolve(headers: &HeaderMap, cookie_name: &str) -> ConnKey {
    let session_id = session_from_cookie(headers, cookie_name)
        .unwrap_or_else(|| format!("anon-{}", random_token(ANON_SESSION_ID_LEN)));

    let ws_key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| random_token(ANON_SESSION_ID_LEN));
    let seq = CONN_SEQ.fetch_add(1, Ordering::Relaxed);

    ConnKey::new(session_id, format!("{}#{}", ws_key, seq))
}

/// Cookie 헤더가 여러 개여도 모두 훑는다. 빈 값은 없는 것으로 본다.
fn session_from_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == cookie_name && !value.is_empty())
        .map(|(_, value)| value.trim_matches('"').to_string())
}
