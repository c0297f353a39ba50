//! 전송 세션 상태
//!
//! 세션 불변식은 이 모듈에서만 강제됨
//! - 수신 인덱스는 항상 `[0, total_chunks)` 범위
//! - 진행률 = 수신 청크 수 / 총 청크 수
//! - 종료 상태(Completed/Failed/Cancelled)에서 다시 활성 상태로 돌아가지 않음
//! - 활성 목록에서 정확히 한 번, 종료 상태로 들어가는 순간 제거됨

use std::collections::{BTreeSet, HashMap, VecDeque};

use tokio::time::Instant;

use crate::chunk::{ChunkIndex, TransferId, TransferMetadata};
use crate::{Config, FailureReason, TimeoutCause};

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Waiting,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// 종료 상태 여부
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// 이 노드에서의 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    /// 이 노드가 보낸 전송
    Outgoing,
    /// 메타데이터를 받아 수신 중인 전송
    Incoming,
}

/// 청크 삽입 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkInsert {
    /// 새로 수신
    Accepted { complete: bool },
    /// 이미 받은 청크
    Duplicate,
    /// 범위를 벗어난 인덱스
    OutOfRange,
    /// 수신 세션이 아니거나 조립 중
    Ignored,
}

/// 정책 평가 결과
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyAction {
    None,
    /// 재전송 요청 전송 (최대 `max_nack_indices`개, 오름차순)
    RequestRetry(Vec<ChunkIndex>),
    Fail(FailureReason),
}

/// 세션 종료 결과
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Failed(FailureReason),
    Cancelled(FailureReason),
}

impl Outcome {
    fn status(&self) -> TransferStatus {
        match self {
            Outcome::Completed => TransferStatus::Completed,
            Outcome::Failed(_) => TransferStatus::Failed,
            Outcome::Cancelled(_) => TransferStatus::Cancelled,
        }
    }
}

/// 전송 세션
#[derive(Debug, Clone)]
pub struct TransferSession {
    metadata: TransferMetadata,
    role: TransferRole,
    received_chunks: BTreeSet<ChunkIndex>,
    status: TransferStatus,
    progress: f64,
    created_at: Instant,
    last_activity: Instant,
    last_retry_request: Option<Instant>,
    error: Option<FailureReason>,
    retry_counts: HashMap<ChunkIndex, u32>,
    assembling: bool,
}

impl TransferSession {
    fn new(metadata: TransferMetadata, role: TransferRole, now: Instant) -> Self {
        Self {
            metadata,
            role,
            received_chunks: BTreeSet::new(),
            status: TransferStatus::Waiting,
            progress: 0.0,
            created_at: now,
            last_activity: now,
            last_retry_request: None,
            error: None,
            retry_counts: HashMap::new(),
            assembling: false,
        }
    }

    /// 송신측 세션 (received_chunks는 사용하지 않음)
    pub fn outgoing(metadata: TransferMetadata, now: Instant) -> Self {
        Self::new(metadata, TransferRole::Outgoing, now)
    }

    /// 수신측 세션
    pub fn incoming(metadata: TransferMetadata, now: Instant) -> Self {
        Self::new(metadata, TransferRole::Incoming, now)
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.metadata
    }

    pub fn transfer_id(&self) -> &str {
        &self.metadata.transfer_id
    }

    pub fn role(&self) -> TransferRole {
        self.role
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn last_retry_request(&self) -> Option<Instant> {
        self.last_retry_request
    }

    pub fn error(&self) -> Option<&FailureReason> {
        self.error.as_ref()
    }

    pub fn received_count(&self) -> usize {
        self.received_chunks.len()
    }

    pub fn has_chunk(&self, index: ChunkIndex) -> bool {
        self.received_chunks.contains(&index)
    }

    pub fn is_assembling(&self) -> bool {
        self.assembling
    }

    /// 모든 청크 수신 여부
    pub fn is_complete(&self) -> bool {
        self.received_chunks.len() == self.metadata.total_chunks as usize
    }

    /// 누락된 청크 인덱스 (오름차순)
    pub fn missing_chunks(&self) -> Vec<ChunkIndex> {
        (0..self.metadata.total_chunks)
            .filter(|i| !self.received_chunks.contains(i))
            .collect()
    }

    /// 청크 수신 기록
    ///
    /// 중복/범위 밖 인덱스는 세션을 변경하지 않음
    pub fn insert_chunk(&mut self, index: ChunkIndex, now: Instant) -> ChunkInsert {
        if self.role != TransferRole::Incoming || self.assembling || self.status.is_terminal() {
            return ChunkInsert::Ignored;
        }
        if index >= self.metadata.total_chunks {
            return ChunkInsert::OutOfRange;
        }
        if !self.received_chunks.insert(index) {
            return ChunkInsert::Duplicate;
        }

        self.last_activity = now;
        self.status = TransferStatus::InProgress;
        self.progress = self.received_chunks.len() as f64 / self.metadata.total_chunks as f64;

        ChunkInsert::Accepted {
            complete: self.is_complete(),
        }
    }

    /// 송신측: 청크를 내보냈음을 기록
    pub fn record_send(&mut self, now: Instant) {
        if self.status == TransferStatus::Waiting {
            self.status = TransferStatus::InProgress;
        }
        self.last_activity = now;
    }

    /// 송신측: 청크 재시도 횟수
    pub fn retry_count(&self, index: ChunkIndex) -> u32 {
        self.retry_counts.get(&index).copied().unwrap_or(0)
    }

    /// 송신측: 재시도 횟수 증가, 증가된 값 반환
    pub fn increment_retry(&mut self, index: ChunkIndex) -> u32 {
        let count = self.retry_counts.entry(index).or_insert(0);
        *count += 1;
        *count
    }

    /// 수신측: 조립 시작 표시 (이후 청크/정책 평가 무시)
    pub fn begin_assembly(&mut self) -> bool {
        if self.role != TransferRole::Incoming || !self.is_complete() || self.assembling {
            return false;
        }
        self.assembling = true;
        true
    }

    /// 비활성 감시 + 누락 청크 정책 평가
    ///
    /// 진행 중(InProgress)인 수신 세션에만 적용. 재전송 요청을 반환할 때
    /// `last_retry_request`를 기록하므로 쿨다운은 여기서만 관리됨
    pub fn evaluate(&mut self, now: Instant, config: &Config) -> PolicyAction {
        if self.role != TransferRole::Incoming
            || self.status != TransferStatus::InProgress
            || self.assembling
        {
            return PolicyAction::None;
        }

        let idle = now.saturating_duration_since(self.last_activity);
        if idle > config.inactivity_timeout() {
            return PolicyAction::Fail(FailureReason::TransferTimeout(TimeoutCause::Inactivity));
        }

        let missing = self.missing_chunks();
        if missing.is_empty() {
            return PolicyAction::None;
        }

        if missing.len() > config.missing_chunk_threshold && idle > config.missing_chunk_timeout() {
            return PolicyAction::Fail(FailureReason::TooManyMissingChunks {
                missing: missing.len(),
            });
        }

        let cooled_down = self
            .last_retry_request
            .map_or(true, |last| now.saturating_duration_since(last) >= config.nack_cooldown());
        if !cooled_down {
            return PolicyAction::None;
        }

        if idle > config.nack_delay() || self.progress > config.nack_progress_threshold {
            self.last_retry_request = Some(now);
            let mut indices = missing;
            indices.truncate(config.max_nack_indices);
            return PolicyAction::RequestRetry(indices);
        }

        PolicyAction::None
    }

    fn finish(&mut self, outcome: Outcome) {
        self.status = outcome.status();
        self.assembling = false;
        self.error = match outcome {
            Outcome::Completed => None,
            Outcome::Failed(reason) | Outcome::Cancelled(reason) => Some(reason),
        };
    }

    /// 외부 조회용 스냅샷
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            transfer_id: self.metadata.transfer_id.clone(),
            file_name: self.metadata.file_name.clone(),
            sender_id: self.metadata.sender_id.clone(),
            role: self.role,
            status: self.status,
            progress: self.progress,
            received_chunks: self.received_chunks.len() as u32,
            total_chunks: self.metadata.total_chunks,
            total_size: self.metadata.total_size,
            error: self.error.clone(),
            elapsed: self.created_at.elapsed(),
        }
    }
}

/// 세션 스냅샷
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub sender_id: String,
    pub role: TransferRole,
    pub status: TransferStatus,
    pub progress: f64,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub total_size: u64,
    pub error: Option<FailureReason>,
    pub elapsed: std::time::Duration,
}

/// 세션 저장소
///
/// 엔진 태스크 하나만 소유하며 외부에는 스냅샷만 노출됨.
/// 종료된 세션은 스냅샷으로만 남고 `history` 개를 넘으면 오래된 것부터 제거됨
#[derive(Debug)]
pub struct SessionStore {
    active: HashMap<TransferId, TransferSession>,
    finished: HashMap<TransferId, SessionSnapshot>,
    finished_order: VecDeque<TransferId>,
    history: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_history(1024)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: usize) -> Self {
        Self {
            active: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            history: history.max(1),
        }
    }

    /// 세션 등록. 같은 ID가 활성/종료 목록에 있으면 false
    pub fn create(&mut self, session: TransferSession) -> bool {
        let id = session.transfer_id();
        if self.is_known(id) {
            return false;
        }
        self.active.insert(id.to_string(), session);
        true
    }

    pub fn get(&self, transfer_id: &str) -> Option<&TransferSession> {
        self.active.get(transfer_id)
    }

    pub fn get_mut(&mut self, transfer_id: &str) -> Option<&mut TransferSession> {
        self.active.get_mut(transfer_id)
    }

    /// 활성 또는 종료된 세션의 스냅샷
    pub fn lookup(&self, transfer_id: &str) -> Option<SessionSnapshot> {
        match self.active.get(transfer_id) {
            Some(session) => Some(session.snapshot()),
            None => self.finished.get(transfer_id).cloned(),
        }
    }

    pub fn is_known(&self, transfer_id: &str) -> bool {
        self.is_active(transfer_id) || self.is_finished(transfer_id)
    }

    pub fn is_active(&self, transfer_id: &str) -> bool {
        self.active.contains_key(transfer_id)
    }

    pub fn is_finished(&self, transfer_id: &str) -> bool {
        self.finished.contains_key(transfer_id)
    }

    /// 세션을 종료 상태로 전이하고 스냅샷을 종료 목록으로 이동
    ///
    /// 활성 세션이 아니면 None. 수신 세션은 모든 청크를 받은 경우에만 Completed 가능
    pub fn finish(&mut self, transfer_id: &str, outcome: Outcome) -> Option<SessionSnapshot> {
        let session = self.active.get(transfer_id)?;
        if outcome == Outcome::Completed
            && session.role == TransferRole::Incoming
            && !session.is_complete()
        {
            return None;
        }

        let mut session = self.active.remove(transfer_id)?;
        session.finish(outcome);
        let snapshot = session.snapshot();

        while self.finished_order.len() >= self.history {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
        self.finished_order.push_back(transfer_id.to_string());
        self.finished.insert(transfer_id.to_string(), snapshot.clone());
        Some(snapshot)
    }

    pub fn active_ids(&self) -> Vec<TransferId> {
        self.active.keys().cloned().collect()
    }

    pub fn active_snapshots(&self) -> Vec<SessionSnapshot> {
        self.active.values().map(TransferSession::snapshot).collect()
    }

    /// 종료 순서대로
    pub fn finished_snapshots(&self) -> Vec<SessionSnapshot> {
        self.finished_order
            .iter()
            .filter_map(|id| self.finished.get(id).cloned())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }
}
