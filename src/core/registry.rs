// SessionRegistry: (session, connection) → ConnectionRecord
//
// 쓰기 경로는 둘뿐이다:
//   협상 성공의 마지막 단계(put) / teardown(remove)
// put은 이미 점유된 키를 덮어쓰지 않는다. 덮어쓰면 앞선 record의 원격 자원과
// 믹서 참조를 아무도 해제하지 않게 된다.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::{session_tag, ConnKey};
use crate::engine::ElementId;
use crate::utils::current_timestamp;

/// 협상이 끝난 커넥션 하나가 점유한 원격 자원
#[derive(Debug)]
pub struct ConnectionRecord {
    pub key:        ConnKey,
    pub endpoint:   ElementId,
    pub hub_port:   ElementId,
    pub created_at: u64,
    /// 로컬 candidate → 클라이언트 전달 태스크
    forwarder:      Option<AbortHandle>,
}

impl ConnectionRecord {
    pub fn new(key: ConnKey, endpoint: ElementId, hub_port: ElementId, forwarder: Option<AbortHandle>) -> Self {
        Self { key, endpoint, hub_port, created_at: current_timestamp(), forwarder }
    }

    pub fn stop_forwarding(&self) {
        if let Some(handle) = &self.forwarder {
            handle.abort();
        }
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, HashMap<String, Arc<ConnectionRecord>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        trace!("Initializing SessionRegistry");
        Self { sessions: RwLock::new(HashMap::new()) }
    }

    /// 같은 키에 record가 이미 있으면 넣지 않고 돌려준다 (호출자가 정리)
    pub fn put(&self, record: ConnectionRecord) -> Result<Arc<ConnectionRecord>, ConnectionRecord> {
        let mut sessions = self.sessions.write().unwrap();
        let conns = sessions.entry(record.key.session_id.clone()).or_default();

        match conns.entry(record.key.connection_id.clone()) {
            Entry::Occupied(_) => {
                warn!("Connection {} already registered, refusing second record", record.key);
                Err(record)
            }
            Entry::Vacant(slot) => {
                let record = Arc::new(record);
                slot.insert(Arc::clone(&record));
                trace!("Connection registered {} endpoint={} hub_port={}", record.key, record.endpoint, record.hub_port);
                Ok(record)
            }
        }
    }

    pub fn get(&self, key: &ConnKey) -> Option<Arc<ConnectionRecord>> {
        self.sessions.read().unwrap()
            .get(&key.session_id)
            .and_then(|conns| conns.get(&key.connection_id))
            .cloned()
    }

    pub fn contains(&self, key: &ConnKey) -> bool {
        self.get(key).is_some()
    }

    /// 세션의 마지막 커넥션이 빠지면 세션 엔트리도 제거
    pub fn remove(&self, key: &ConnKey) -> Option<Arc<ConnectionRecord>> {
        let mut sessions = self.sessions.write().unwrap();
        let conns   = sessions.get_mut(&key.session_id)?;
        let removed = conns.remove(&key.connection_id);
        if conns.is_empty() {
            sessions.remove(&key.session_id);
            debug!("Session {} removed (no connections left)", key.session_id);
        }
        removed
    }

    /// 등록된 커넥션 수
    pub fn count(&self) -> usize {
        self.sessions.read().unwrap().values().map(HashMap::len).sum()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// 세션 하나의 커넥션 목록 (admin 조회용)
    pub fn session(&self, session_id: &str) -> Vec<Arc<ConnectionRecord>> {
        self.sessions.read().unwrap()
            .get(session_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 세션 표식으로 조회 (admin 조회용: 외부에는 쿠키 원문 대신 표식만 보인다)
    pub fn session_by_tag(&self, tag: &str) -> Vec<Arc<ConnectionRecord>> {
        self.sessions.read().unwrap()
            .iter()
            .find(|(session_id, _)| session_tag(session_id) == tag)
            .map(|(_, conns)| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 전체 커넥션 스냅샷 (admin 조회용)
    pub fn snapshot(&self) -> Vec<Arc<ConnectionRecord>> {
        self.sessions.read().unwrap()
            .values()
            .flat_map(|conns| conns.values().cloned())
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
