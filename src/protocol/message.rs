use serde::{Deserialize, Serialize};

use crate::engine::IceCandidate;
use crate::error::{McuError, McuResult};

// ----------------------------------------------------------------------------
// [C→S] 클라이언트 메시지
// ----------------------------------------------------------------------------

/// 예시:
///   { "id": "start", "sdpOffer": "v=0..." }
///   { "id": "candidate", "candidate": { "candidate": "...", "sdpMid": "0", "sdpMLineIndex": 0 } }
///   { "id": "stop" }
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    Start {
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
    },
    Stop,
    #[serde(alias = "onIceCandidate")]
    Candidate {
        candidate: IceCandidate,
    },
}

impl ClientMessage {
    /// 알 수 없는 id와 필드 누락을 구분해 에러 메시지를 만든다.
    pub fn parse(text: &str) -> McuResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| McuError::InvalidMessage(format!("(undecodable frame: {})", e)))?;

        let id = match value.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None     => return Err(McuError::InvalidMessage("(missing id)".into())),
        };

        serde_json::from_value(value).map_err(|e| match id.as_str() {
            "start" | "stop" | "candidate" | "onIceCandidate" => {
                McuError::InvalidMessage(format!("{} ({})", id, e))
            }
            _ => McuError::InvalidMessage(id),
        })
    }

    /// trace / 로그용
    pub fn id(&self) -> &'static str {
        match self {
            ClientMessage::Start { .. }     => "start",
            ClientMessage::Stop             => "stop",
            ClientMessage::Candidate { .. } => "candidate",
        }
    }
}

// ----------------------------------------------------------------------------
// [S→C] 서버 메시지
// ----------------------------------------------------------------------------

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    StartResponse {
        #[serde(rename = "sdpAnswer")]
        sdp_answer: String,
    },
    Error {
        message: String,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
}

impl ServerMessage {
    pub fn error(err: &McuError) -> Self {
        ServerMessage::Error { message: err.to_string() }
    }

    pub fn id(&self) -> &'static str {
        match self {
            ServerMessage::StartResponse { .. } => "startResponse",
            ServerMessage::Error { .. }         => "error",
            ServerMessage::IceCandidate { .. }  => "iceCandidate",
        }
    }

    pub fn to_json(&self) -> String {
        // 직렬화 실패 불가 (String 필드뿐)
        serde_json::to_string(self).unwrap_or_default()
    }
}
