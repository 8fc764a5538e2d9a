// Mcu: 시그널링 코어 컨텍스트
// 전역 변수 대신 이 객체 하나를 핸들러에 주입한다.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, trace, warn};

use super::{CandidateQueue, ConnKey, MixerStats, SessionRegistry, SharedMixer};
use crate::config::MediaSettings;
use crate::engine::{EngineConnector, EngineHandle, IceCandidate};

/// 원격 candidate 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// endpoint에 즉시 전달
    Delivered,
    /// endpoint가 아직 없어 큐에 보관
    Queued,
}

#[derive(Debug, Clone, Serialize)]
pub struct McuStats {
    pub sessions:          usize,
    pub connections:       usize,
    pub pending_entries:   usize,
    pub mixer:             MixerStats,
}

pub struct Mcu {
    pub(crate) engine:   EngineHandle,
    pub(crate) settings: MediaSettings,
    pub mixer:    SharedMixer,
    pub registry: SessionRegistry,
    pub queue:    CandidateQueue,
}

impl Mcu {
    pub fn new(connector: Arc<dyn EngineConnector>, settings: MediaSettings) -> Self {
        Self {
            engine:   EngineHandle::new(connector),
            settings,
            mixer:    SharedMixer::new(),
            registry: SessionRegistry::new(),
            queue:    CandidateQueue::new(),
        }
    }

    pub fn settings(&self) -> &MediaSettings {
        &self.settings
    }

    pub fn engine_description(&self) -> String {
        self.engine.describe()
    }

    /// record가 있으면 endpoint로 바로 전달, 없으면 큐에 보관
    pub async fn deliver_or_enqueue(&self, key: &ConnKey, candidate: IceCandidate) -> Delivery {
        let Some(record) = self.registry.get(key) else {
            self.queue.enqueue(key, candidate);
            return Delivery::Queued;
        };

        match self.engine.current() {
            Some(engine) => {
                trace!("[ice] candidate → endpoint {} {}", record.endpoint, key);
                if let Err(e) = engine.add_candidate(&record.endpoint, &candidate).await {
                    warn!("[ice] endpoint {} rejected candidate {}: {}", record.endpoint, key, e);
                }
            }
            None => warn!("[ice] no engine client, candidate for {} dropped", key),
        }
        Delivery::Delivered
    }

    /// 프로세스 종료: 공유 파이프라인이 있으면 해제
    pub async fn shutdown(&self) {
        let Some(engine) = self.engine.current() else {
            return;
        };
        if self.mixer.shutdown(engine.as_ref()).await {
            info!("[mcu] shared pipeline released on shutdown");
        }
    }

    pub fn stats(&self) -> McuStats {
        McuStats {
            sessions:        self.registry.session_count(),
            connections:     self.registry.count(),
            pending_entries: self.queue.len(),
            mixer:           self.mixer.stats(),
        }
    }
}
