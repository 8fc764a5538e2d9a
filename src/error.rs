// 시그널링 계층 에러 분류
// 원격 엔진 호출 실패는 모두 여기서 로컬 복구 가능한 kind로 변환되어 해당 커넥션에만 보고된다.

use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum McuError {
    /// 식별자 누락, 잘못된 요청 파라미터
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// 알 수 없는 메시지 id 또는 디코딩 불가 프레임
    #[error("Invalid message {0}")]
    InvalidMessage(String),

    #[error("Media engine unavailable: {0}")]
    EngineUnavailable(#[source] EngineError),

    /// 공유 파이프라인/믹서 생성 실패
    #[error("Could not create shared mixer: {0}")]
    MixerUnavailable(#[source] EngineError),

    /// 커넥션별 endpoint / hub port 할당 실패
    #[error("Media element allocation failed: {0}")]
    AllocationFailed(#[source] EngineError),

    #[error("Wiring endpoint to mixer failed: {0}")]
    WiringFailed(#[source] EngineError),

    #[error("SDP negotiation failed: {0}")]
    NegotiationFailed(#[source] EngineError),

    #[error("A negotiation is already in progress for this connection")]
    AlreadyNegotiating,

    #[error("This connection is already active")]
    AlreadyActive,

    /// 원격 release 실패: 로컬 상태는 이미 제거된 뒤에 반환된다
    #[error("Teardown incomplete, {failed} remote release(s) failed: {detail}")]
    TeardownPartialFailure { failed: usize, detail: String },
}

pub type McuResult<T> = Result<T, McuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_message_keeps_client_facing_prefix() {
        let err = McuError::InvalidMessage("ping".into());
        assert_eq!(err.to_string(), "Invalid message ping");
    }

    #[test]
    fn engine_errors_are_exposed_as_source() {
        use std::error::Error as _;
        let err = McuError::WiringFailed(EngineError::Closed);
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("Wiring endpoint to mixer failed"));
    }
}
