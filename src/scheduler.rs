//! 지연 작업 스케줄러
//!
//! (전송 ID, 타이머 종류) 키 하나에 타이머 하나. 같은 키로 다시 예약하면
//! 이전 타이머는 취소됨. 타이머가 만료되면 이벤트를 채널로 보내고,
//! 상태 변경은 채널을 소비하는 엔진 태스크에서만 일어남

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::chunk::{ChunkIndex, TransferId};

/// 타이머 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// 청크 재시도 타이머
    ChunkRetry(ChunkIndex),
    /// 지터/스태거 후 청크 재전송
    Retransmit(ChunkIndex),
    /// 다음 청크 전송 (페이싱)
    Pacing,
    /// 전송 전체 데드라인
    Deadline,
    /// 주기적 진행 모니터
    Monitor,
}

/// 타이머 키
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub transfer_id: TransferId,
    pub kind: TimerKind,
}

impl TimerKey {
    pub fn new(transfer_id: impl Into<TransferId>, kind: TimerKind) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            kind,
        }
    }
}

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    handle: AbortHandle,
}

type TimerTable = DashMap<TimerKey, TimerEntry>;

/// 예약된 타이머 핸들
///
/// drop해도 타이머는 취소되지 않음. 취소는 `cancel()` 또는 스케줄러의 키 기반 취소로
#[derive(Debug, Clone)]
pub struct TimerHandle {
    key: TimerKey,
    generation: u64,
    tasks: Arc<TimerTable>,
}

impl TimerHandle {
    pub fn key(&self) -> &TimerKey {
        &self.key
    }

    /// 이 핸들이 가리키는 타이머가 아직 예약 상태인지
    pub fn is_pending(&self) -> bool {
        self.tasks
            .get(&self.key)
            .map_or(false, |entry| entry.generation == self.generation)
    }

    /// 타이머 취소. 이미 만료되었거나 같은 키로 재예약된 경우 false
    pub fn cancel(&self) -> bool {
        match self
            .tasks
            .remove_if(&self.key, |_, entry| entry.generation == self.generation)
        {
            Some((_, entry)) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }
}

/// 재시도 스케줄러
pub struct RetryScheduler<T> {
    tx: mpsc::Sender<T>,
    tasks: Arc<TimerTable>,
    next_generation: AtomicU64,
}

impl<T: Send + 'static> RetryScheduler<T> {
    /// 만료 이벤트를 `tx`로 보내는 스케줄러 생성
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self {
            tx,
            tasks: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// `delay` 후 한 번 `event`를 보냄
    pub fn schedule(&self, key: TimerKey, delay: Duration, event: T) -> TimerHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();
        let tx = self.tx.clone();
        let task_key = key.clone();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let deadline = Instant::now() + delay;

        let join = tokio::spawn(async move {
            // 테이블 등록 전에 만료 처리되지 않도록 대기
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep_until(deadline).await;
            tasks.remove_if(&task_key, |_, entry| entry.generation == generation);
            let _ = tx.send(event).await;
        });

        self.register(key, generation, join.abort_handle(), armed_tx)
    }

    /// `period`마다 `make()`가 만든 이벤트를 보냄 (첫 발생은 `period` 후)
    pub fn schedule_repeating<F>(&self, key: TimerKey, period: Duration, make: F) -> TimerHandle
    where
        F: Fn() -> T + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();
        let tx = self.tx.clone();
        let task_key = key.clone();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let start = Instant::now() + period;

        let join = tokio::spawn(async move {
            if armed_rx.await.is_err() {
                return;
            }
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                if tx.send(make()).await.is_err() {
                    break;
                }
            }
            tasks.remove_if(&task_key, |_, entry| entry.generation == generation);
        });

        self.register(key, generation, join.abort_handle(), armed_tx)
    }

    fn register(
        &self,
        key: TimerKey,
        generation: u64,
        handle: AbortHandle,
        armed_tx: oneshot::Sender<()>,
    ) -> TimerHandle {
        if let Some(previous) = self
            .tasks
            .insert(key.clone(), TimerEntry { generation, handle })
        {
            previous.handle.abort();
        }
        let _ = armed_tx.send(());

        TimerHandle {
            key,
            generation,
            tasks: self.tasks.clone(),
        }
    }

    /// 키로 취소
    pub fn cancel(&self, key: &TimerKey) -> bool {
        match self.tasks.remove(key) {
            Some((_, entry)) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// 전송 하나의 모든 타이머 취소, 취소한 개수 반환
    pub fn cancel_transfer(&self, transfer_id: &str) -> usize {
        let mut cancelled = 0;
        self.tasks.retain(|key, entry| {
            if key.transfer_id == transfer_id {
                entry.handle.abort();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        if cancelled > 0 {
            debug!("전송 {} 타이머 {}개 해제", transfer_id, cancelled);
        }
        cancelled
    }

    /// 모든 타이머 취소
    pub fn cancel_all(&self) {
        self.tasks.retain(|_, entry| {
            entry.handle.abort();
            false
        });
    }

    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// 전송 하나에 걸린 타이머 수
    pub fn pending_for(&self, transfer_id: &str) -> usize {
        self.tasks
            .iter()
            .filter(|entry| entry.key().transfer_id == transfer_id)
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.len()
    }
}
