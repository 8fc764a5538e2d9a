// SharedMixer: 회의 전체가 공유하는 단일 파이프라인 + 믹서(Composite)
//
// 불변식: handles 존재 ⇔ participants ≥ 1
//   acquire: 0 → 1 전이에서 pipeline → mixer 순으로 원격 생성
//   release: 1 → 0 전이에서 pipeline 원격 해제 (mixer는 pipeline과 함께 사라짐)
//
// 생성/해제 판단과 카운트 증감은 하나의 async Mutex 안에서만 일어난다.
// lock을 원격 호출이 끝날 때까지 유지하므로
//   - 동시 첫 join은 진행 중인 생성 결과를 기다렸다가 카운트만 올리고
//   - 해제 중에 들어온 acquire는 해제 완료 후 새 파이프라인을 만든다.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, trace, warn};

use crate::engine::{ElementId, ElementSpec, EngineResult, MediaEngine};
use crate::error::{McuError, McuResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixHandles {
    pub pipeline: ElementId,
    pub hub:      ElementId,
}

#[derive(Default)]
struct MixerState {
    handles:      Option<MixHandles>,
    participants: usize,
}

/// admin 조회용 스냅샷
#[derive(Debug, Clone, Serialize)]
pub struct MixerStats {
    pub active:       bool,
    pub participants: usize,
    pub created:      u64,
    pub destroyed:    u64,
}

pub struct SharedMixer {
    state:        Mutex<MixerState>,
    // lock 없이 읽기 위한 미러 값: 쓰기는 항상 state lock 안에서
    participants: AtomicUsize,
    created:      AtomicU64,
    destroyed:    AtomicU64,
}

impl SharedMixer {
    pub fn new() -> Self {
        trace!("Initializing SharedMixer");
        Self {
            state:        Mutex::new(MixerState::default()),
            participants: AtomicUsize::new(0),
            created:      AtomicU64::new(0),
            destroyed:    AtomicU64::new(0),
        }
    }

    pub async fn acquire(&self, engine: &dyn MediaEngine) -> McuResult<MixHandles> {
        let mut state = self.state.lock().await;

        if let Some(handles) = state.handles.clone() {
            state.participants += 1;
            self.participants.store(state.participants, Ordering::Relaxed);
            trace!("[mixer] joined existing pipeline {} (participants={})", handles.pipeline, state.participants);
            return Ok(handles);
        }

        info!("[mixer] Creating MediaPipeline and Composite...");
        let handles = create_pipeline_and_hub(engine).await.map_err(McuError::MixerUnavailable)?;

        state.handles      = Some(handles.clone());
        state.participants = 1;
        self.participants.store(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        info!("[mixer] pipeline={} hub={} ready", handles.pipeline, handles.hub);
        Ok(handles)
    }

    pub async fn release(&self, engine: &dyn MediaEngine) {
        let mut state = self.state.lock().await;

        if state.participants == 0 {
            warn!("[mixer] release without matching acquire ignored");
            return;
        }

        state.participants -= 1;
        self.participants.store(state.participants, Ordering::Relaxed);
        if state.participants > 0 {
            trace!("[mixer] participant left (participants={})", state.participants);
            return;
        }

        if let Some(handles) = state.handles.take() {
            info!("[mixer] Removing MediaPipeline and Composite...");
            if let Err(e) = engine.release(&handles.pipeline).await {
                // 원격 정리는 불완전해도 로컬 상태는 비운다
                error!("[mixer] pipeline {} release failed: {}", handles.pipeline, e);
            }
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 프로세스 종료: 참가자 수와 무관하게 파이프라인 해제
    pub async fn shutdown(&self, engine: &dyn MediaEngine) -> bool {
        let mut state = self.state.lock().await;
        let Some(handles) = state.handles.take() else {
            return false;
        };

        info!("[mixer] shutdown: removing MediaPipeline (participants={})", state.participants);
        if let Err(e) = engine.release(&handles.pipeline).await {
            error!("[mixer] pipeline {} release failed on shutdown: {}", handles.pipeline, e);
        }
        state.participants = 0;
        self.participants.store(0, Ordering::Relaxed);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn participants(&self) -> usize {
        self.participants.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.participants() > 0
    }

    pub fn stats(&self) -> MixerStats {
        MixerStats {
            active:       self.is_active(),
            participants: self.participants(),
            created:      self.created.load(Ordering::Relaxed),
            destroyed:    self.destroyed.load(Ordering::Relaxed),
        }
    }
}

impl Default for SharedMixer {
    fn default() -> Self {
        Self::new()
    }
}

/// pipeline → mixer 순 생성. mixer 실패 시 pipeline을 되돌려 반쪽 상태를 남기지 않는다.
async fn create_pipeline_and_hub(engine: &dyn MediaEngine) -> EngineResult<MixHandles> {
    let pipeline = engine.create(ElementSpec::Pipeline).await?;

    match engine.create(ElementSpec::Mixer { pipeline: pipeline.clone() }).await {
        Ok(hub) => Ok(MixHandles { pipeline, hub }),
        Err(e) => {
            if let Err(release_err) = engine.release(&pipeline).await {
                warn!("[mixer] orphan pipeline {} release failed: {}", pipeline, release_err);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ElementType, EngineOp, LoopbackEngine};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn first_acquire_creates_pipeline_and_hub() {
        let engine = LoopbackEngine::new();
        let mixer  = SharedMixer::new();

        let handles = mixer.acquire(&engine).await.unwrap();

        assert!(engine.is_live(&handles.pipeline));
        assert!(engine.is_live(&handles.hub));
        assert_eq!(mixer.participants(), 1);
    }

    #[tokio::test]
    async fn count_sequence_0_1_2_1_0_creates_and_destroys_once() {
        let engine = LoopbackEngine::new();
        let mixer  = SharedMixer::new();

        let a = mixer.acquire(&engine).await.unwrap();
        let b = mixer.acquire(&engine).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(mixer.participants(), 2);

        mixer.release(&engine).await;
        assert_eq!(engine.released(ElementType::Pipeline), 0, "참가자가 남아있으면 해제되면 안 됩니다.");
        assert!(engine.is_live(&a.pipeline));

        mixer.release(&engine).await;
        assert_eq!(engine.created(ElementType::Pipeline), 1);
        assert_eq!(engine.released(ElementType::Pipeline), 1);
        assert!(!engine.is_live(&a.pipeline));
        assert!(!mixer.stats().active);
    }

    #[tokio::test]
    async fn resource_is_recreated_after_returning_to_zero() {
        let engine = LoopbackEngine::new();
        let mixer  = SharedMixer::new();

        let first = mixer.acquire(&engine).await.unwrap();
        mixer.release(&engine).await;
        let second = mixer.acquire(&engine).await.unwrap();

        assert_ne!(first.pipeline, second.pipeline);
        assert_eq!(engine.created(ElementType::Pipeline), 2);
        assert_eq!(mixer.stats().created, 2);
        assert_eq!(mixer.stats().destroyed, 1);
    }

    #[tokio::test]
    async fn concurrent_first_acquires_create_one_pipeline() {
        let engine = Arc::new(LoopbackEngine::with_latency(Duration::from_millis(20)));
        let mixer  = Arc::new(SharedMixer::new());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            let mixer  = Arc::clone(&mixer);
            tasks.push(tokio::spawn(async move { mixer.acquire(engine.as_ref()).await.unwrap() }));
        }
        let mut handles = Vec::new();
        for t in tasks {
            handles.push(t.await.unwrap());
        }

        assert!(handles.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(engine.created(ElementType::Pipeline), 1);
        assert_eq!(engine.created(ElementType::Mixer), 1);
        assert_eq!(mixer.participants(), 8);
    }

    #[tokio::test]
    async fn acquire_during_last_teardown_waits_then_builds_fresh_pipeline() {
        let engine = Arc::new(LoopbackEngine::new().with_release_latency(Duration::from_millis(50)));
        let mixer  = Arc::new(SharedMixer::new());
        let old    = mixer.acquire(engine.as_ref()).await.unwrap();

        let leaving = {
            let engine = Arc::clone(&engine);
            let mixer  = Arc::clone(&mixer);
            tokio::spawn(async move { mixer.release(engine.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!leaving.is_finished(), "teardown이 진행 중이어야 합니다.");

        let fresh = mixer.acquire(engine.as_ref()).await.unwrap();
        assert!(!engine.is_live(&old.pipeline), "acquire는 teardown 완료 뒤에 돌아와야 합니다.");
        leaving.await.unwrap();

        assert_ne!(fresh.pipeline, old.pipeline);
        assert!(engine.is_live(&fresh.pipeline));
        assert!(engine.is_live(&fresh.hub));
        assert!(!engine.is_live(&old.pipeline));
        assert_eq!(mixer.stats().created, 2);
        assert_eq!(mixer.stats().destroyed, 1);
        assert_eq!(mixer.participants(), 1);
    }

    #[tokio::test]
    async fn hub_failure_leaves_no_half_created_state() {
        let engine = LoopbackEngine::new();
        let mixer  = SharedMixer::new();
        engine.fail(EngineOp::CreateMixer);

        let err = mixer.acquire(&engine).await.unwrap_err();

        assert!(matches!(err, McuError::MixerUnavailable(_)));
        assert_eq!(mixer.participants(), 0);
        assert_eq!(engine.live(ElementType::Pipeline), 0, "고아 파이프라인이 남으면 안 됩니다.");

        engine.clear_failure(EngineOp::CreateMixer);
        assert!(mixer.acquire(&engine).await.is_ok());
        assert_eq!(mixer.participants(), 1);
    }

    #[tokio::test]
    async fn failed_remote_teardown_still_clears_local_state() {
        let engine = LoopbackEngine::new();
        let mixer  = SharedMixer::new();
        mixer.acquire(&engine).await.unwrap();

        engine.fail(EngineOp::Release);
        mixer.release(&engine).await;
        engine.clear_failure(EngineOp::Release);

        assert_eq!(mixer.participants(), 0);
        assert!(!mixer.stats().active);
        mixer.acquire(&engine).await.unwrap();
        assert_eq!(engine.created(ElementType::Pipeline), 2);
    }

    #[tokio::test]
    async fn unmatched_release_is_ignored() {
        let engine = LoopbackEngine::new();
        let mixer  = SharedMixer::new();
        mixer.release(&engine).await;
        assert_eq!(mixer.participants(), 0);
        assert_eq!(mixer.stats().destroyed, 0);
    }

    #[tokio::test]
    async fn shutdown_releases_pipeline_regardless_of_count() {
        let engine = LoopbackEngine::new();
        let mixer  = SharedMixer::new();
        let h = mixer.acquire(&engine).await.unwrap();
        mixer.acquire(&engine).await.unwrap();

        assert!(mixer.shutdown(&engine).await);
        assert!(!engine.is_live(&h.pipeline));
        assert_eq!(mixer.participants(), 0);
        assert!(!mixer.shutdown(&engine).await);
    }
}
