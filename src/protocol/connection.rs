// 커넥션 단위 프로토콜 상태 머신
//
//   Idle ──start──▶ Negotiating ──성공──▶ Active
//     ▲                  │
//     └──────실패─────────┘
//   (어느 상태든) ──stop / close / error──▶ Closed (흡수 상태)
//
// 전이 판단만 담당한다. 실제 협상/해제는 protocol.rs가 Mcu를 호출해 수행.

use crate::error::{McuError, McuResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Negotiating,
    Active,
    Closed,
}

/// 원격 candidate 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateRoute {
    /// record가 있으면 endpoint로, 없으면 큐로 (Mcu::deliver_or_enqueue)
    Direct,
    /// 협상 중: 무조건 큐. 협상 마지막 flush가 순서대로 전달한다.
    Queue,
    /// Closed
    Drop,
}

impl ConnState {
    /// start 수신: 성공 시 Negotiating으로 전이
    pub fn on_start(&mut self) -> McuResult<()> {
        match self {
            ConnState::Idle => {
                *self = ConnState::Negotiating;
                Ok(())
            }
            ConnState::Negotiating => Err(McuError::AlreadyNegotiating),
            ConnState::Active      => Err(McuError::AlreadyActive),
            ConnState::Closed      => Err(McuError::InvalidRequest("connection closed".into())),
        }
    }

    /// 협상 결과 반영. Closed 이후 도착한 결과는 상태를 바꾸지 않는다.
    pub fn on_negotiated(&mut self, success: bool) {
        if *self == ConnState::Negotiating {
            *self = if success { ConnState::Active } else { ConnState::Idle };
        }
    }

    pub fn on_close(&mut self) {
        *self = ConnState::Closed;
    }

    pub fn candidate_route(&self) -> CandidateRoute {
        match self {
            ConnState::Idle | ConnState::Active => CandidateRoute::Direct,
            ConnState::Negotiating              => CandidateRoute::Queue,
            ConnState::Closed                   => CandidateRoute::Drop,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self == ConnState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut s = ConnState::Idle;
        s.on_start().unwrap();
        assert_eq!(s, ConnState::Negotiating);
        s.on_negotiated(true);
        assert_eq!(s, ConnState::Active);
        s.on_close();
        assert!(s.is_closed());
    }

    #[test]
    fn failed_negotiation_returns_to_idle_and_allows_retry() {
        let mut s = ConnState::Idle;
        s.on_start().unwrap();
        s.on_negotiated(false);
        assert_eq!(s, ConnState::Idle);
        assert!(s.on_start().is_ok());
    }

    #[test]
    fn second_start_is_rejected() {
        let mut s = ConnState::Negotiating;
        assert!(matches!(s.on_start(), Err(McuError::AlreadyNegotiating)));
        assert_eq!(s, ConnState::Negotiating);

        let mut s = ConnState::Active;
        assert!(matches!(s.on_start(), Err(McuError::AlreadyActive)));
    }

    #[test]
    fn closed_is_absorbing() {
        let mut s = ConnState::Closed;
        assert!(s.on_start().is_err());
        s.on_negotiated(true);
        assert_eq!(s, ConnState::Closed);
        assert_eq!(s.candidate_route(), CandidateRoute::Drop);
    }

    #[test]
    fn candidates_are_queued_while_negotiating() {
        assert_eq!(ConnState::Negotiating.candidate_route(), CandidateRoute::Queue);
        assert_eq!(ConnState::Active.candidate_route(), CandidateRoute::Direct);
        assert_eq!(ConnState::Idle.candidate_route(), CandidateRoute::Direct);
    }
}
