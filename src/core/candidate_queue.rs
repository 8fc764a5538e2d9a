// CandidateQueue: endpoint가 아직 없는 커넥션의 원격 ICE candidate 버퍼
//
// 키가 처음 쓰일 때 엔트리를 만들고, 읽을 때 엔트리가 없으면 no-op.
// 엔트리는 ConnectionRecord가 생기기 전까지만 존재한다.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{trace, warn};

use super::ConnKey;
use crate::engine::{ElementId, IceCandidate, MediaEngine};

pub struct CandidateQueue {
    pending: Mutex<HashMap<ConnKey, Vec<IceCandidate>>>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    pub fn enqueue(&self, key: &ConnKey, candidate: IceCandidate) {
        let mut pending = self.pending.lock().unwrap();
        let queue = pending.entry(key.clone()).or_default();
        queue.push(candidate);
        trace!("Candidate queued {} (pending={})", key, queue.len());
    }

    /// 엔트리를 통째로 꺼낸다 (도착 순서 유지)
    pub fn take(&self, key: &ConnKey) -> Option<Vec<IceCandidate>> {
        self.pending.lock().unwrap().remove(key)
    }

    /// 버퍼된 candidate를 FIFO 순서로 endpoint에 전달하고 엔트리를 제거한다.
    /// 전달 도중 새로 쌓인 candidate까지 엔트리가 빌 때까지 반복한다.
    /// 반환값: 전달 시도한 candidate 수
    pub async fn drain_and_deliver(
        &self,
        key:      &ConnKey,
        engine:   &dyn MediaEngine,
        endpoint: &ElementId,
    ) -> usize {
        let mut delivered = 0;
        while let Some(batch) = self.take(key) {
            for candidate in batch {
                if let Err(e) = engine.add_candidate(endpoint, &candidate).await {
                    warn!("[ice] queued candidate rejected by endpoint {} {}: {}", endpoint, key, e);
                }
                delivered += 1;
            }
        }
        if delivered > 0 {
            trace!("Flushed {} queued candidate(s) for {}", delivered, key);
        }
        delivered
    }

    /// 잔여 엔트리 폐기 (teardown)
    pub fn discard(&self, key: &ConnKey) -> usize {
        self.take(key).map(|q| q.len()).unwrap_or(0)
    }

    pub fn pending_for(&self, key: &ConnKey) -> usize {
        self.pending.lock().unwrap().get(key).map(Vec::len).unwrap_or(0)
    }

    pub fn contains(&self, key: &ConnKey) -> bool {
        self.pending.lock().unwrap().contains_key(key)
    }

    /// 대기 엔트리(키) 수
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new()
    }
}
