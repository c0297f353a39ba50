//! 수신 처리
//!
//! - 메타데이터 수신 시 세션 생성, 데드라인/진행 모니터 등록
//! - 청크 검증 후 저장, 진행률 갱신
//! - 누락 청크 정책: 재전송 요청(NACK, 쿨다운 적용) 또는 실패 처리
//! - 모든 청크 수신 시 워커에서 조립 + 체크섬 검증 + 최종 파일 저장

use std::path::PathBuf;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chunk::{Chunk, TransferMetadata};
use crate::delegate::TransferEvent;
use crate::engine::{EngineCmd, EngineInner, TimerEvent};
use crate::message::{Message, RetryRequest};
use crate::scheduler::{TimerKey, TimerKind};
use crate::session::{ChunkInsert, Outcome, PolicyAction, TransferRole, TransferSession};
use crate::store::{chunk_key, metadata_key};
use crate::worker::StorageJob;
use crate::FailureReason;

impl EngineInner {
    /// 전송 시작 알림 수신
    pub(crate) fn on_metadata(&mut self, metadata: TransferMetadata, from: &str) {
        if let Err(e) = metadata.validate() {
            warn!("메타데이터 거부 (from {}): {}", from, e);
            return;
        }
        if metadata.chunk_size as usize != self.config.chunk_size {
            warn!(
                "메타데이터 거부 (from {}): chunk_size {} != {}",
                from, metadata.chunk_size, self.config.chunk_size
            );
            return;
        }

        let transfer_id = metadata.transfer_id.clone();
        if self.sessions.is_known(&transfer_id) {
            debug!("이미 알고 있는 전송: {}", transfer_id);
            return;
        }

        let metadata_bytes = match bincode::serialize(&metadata) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("메타데이터 직렬화 실패: {}: {}", transfer_id, e);
                return;
            }
        };

        info!(
            "수신 시작: {} ({}, {} bytes, {} 청크) from {}",
            transfer_id, metadata.file_name, metadata.total_size, metadata.total_chunks, from
        );

        self.emit(TransferEvent::Started {
            transfer_id: transfer_id.clone(),
            role: TransferRole::Incoming,
            file_name: metadata.file_name.clone(),
            total_chunks: metadata.total_chunks,
        });
        self.sessions
            .create(TransferSession::incoming(metadata, Instant::now()));
        self.stats.incoming_transfers += 1;

        self.submit(StorageJob::Put {
            transfer_id: transfer_id.clone(),
            key: metadata_key(&transfer_id),
            bytes: metadata_bytes,
        });

        self.schedule(
            &transfer_id,
            TimerKind::Deadline,
            self.config.transfer_timeout(),
            TimerEvent::Deadline {
                transfer_id: transfer_id.clone(),
            },
        );
        let monitor_id = transfer_id.clone();
        self.scheduler.schedule_repeating(
            TimerKey::new(transfer_id, TimerKind::Monitor),
            self.config.monitor_interval(),
            move || {
                EngineCmd::Timer(TimerEvent::Monitor {
                    transfer_id: monitor_id.clone(),
                })
            },
        );
    }

    /// 청크 수신
    pub(crate) fn on_chunk(&mut self, chunk: Chunk, from: &str) {
        let now = Instant::now();
        let transfer_id = chunk.transfer_id.clone();

        let Some(session) = self.sessions.get_mut(&transfer_id) else {
            if self.sessions.is_finished(&transfer_id) {
                debug!("종료된 전송의 청크: {} #{}", transfer_id, chunk.index);
            } else {
                // 메타데이터보다 먼저 온 청크는 보관하지 않음
                self.stats.orphan_chunks += 1;
                debug!("메타데이터 없는 청크 폐기: {} #{} from {}", transfer_id, chunk.index, from);
            }
            return;
        };
        if session.role() != TransferRole::Incoming {
            return;
        }

        match session.metadata().expected_chunk_len(chunk.index) {
            Some(expected) if expected == chunk.data.len() => {}
            Some(expected) => {
                self.stats.rejected_chunks += 1;
                warn!(
                    "청크 길이 불일치: {} #{} (expected {}, got {})",
                    transfer_id,
                    chunk.index,
                    expected,
                    chunk.data.len()
                );
                return;
            }
            None => {
                self.stats.rejected_chunks += 1;
                warn!(
                    "범위 밖 청크: {} #{} (총 {}개)",
                    transfer_id,
                    chunk.index,
                    session.metadata().total_chunks
                );
                return;
            }
        }

        match session.insert_chunk(chunk.index, now) {
            ChunkInsert::Accepted { complete } => {
                let received = session.received_count() as u32;
                let total = session.metadata().total_chunks;

                self.stats.chunks_received += 1;
                self.stats.bytes_received += chunk.data.len() as u64;
                self.submit(StorageJob::Put {
                    transfer_id: transfer_id.clone(),
                    key: chunk_key(&transfer_id, chunk.index),
                    bytes: chunk.data.to_vec(),
                });
                self.emit(TransferEvent::Progress {
                    transfer_id: transfer_id.clone(),
                    received,
                    total,
                });

                if complete {
                    self.begin_assembly(&transfer_id);
                } else {
                    self.apply_policy(&transfer_id, now);
                }
            }
            ChunkInsert::Duplicate => {
                self.stats.duplicate_chunks += 1;
                debug!("중복 청크: {} #{}", transfer_id, chunk.index);
            }
            ChunkInsert::OutOfRange => {
                self.stats.rejected_chunks += 1;
            }
            ChunkInsert::Ignored => {}
        }
    }

    /// 비활성 감시 + 누락 청크 정책 적용
    pub(crate) fn apply_policy(&mut self, transfer_id: &str, now: Instant) {
        let Some(session) = self.sessions.get_mut(transfer_id) else {
            return;
        };

        match session.evaluate(now, &self.config) {
            PolicyAction::None => {}
            PolicyAction::RequestRetry(missing) => {
                debug!(
                    "재전송 요청: {} ({:.0}% 수신), {:?}",
                    transfer_id,
                    session.progress() * 100.0,
                    missing
                );
                let request = RetryRequest::new(transfer_id.to_string(), missing.clone());
                if self.broadcast_message(&Message::RetryRequest(request)) {
                    self.stats.retry_requests_sent += 1;
                }
                self.emit(TransferEvent::RetryRequested {
                    transfer_id: transfer_id.to_string(),
                    missing,
                });
            }
            PolicyAction::Fail(reason) => self.fail(transfer_id, reason),
        }
    }

    /// 모든 청크 수신: 타이머 해제 후 워커에 조립 요청
    fn begin_assembly(&mut self, transfer_id: &str) {
        let Some(session) = self.sessions.get_mut(transfer_id) else {
            return;
        };
        if !session.begin_assembly() {
            return;
        }
        let metadata = session.metadata().clone();

        self.scheduler.cancel_transfer(transfer_id);
        let path = self
            .delegate
            .resolve_storage_path(transfer_id, &metadata.file_name);
        info!(
            "모든 청크 수신: {} -> {} 조립 시작",
            transfer_id,
            path.display()
        );

        if !self.submit(StorageJob::Assemble { metadata, path }) {
            self.fail(
                transfer_id,
                FailureReason::StorageWriteFailure("저장소 워커 종료됨".into()),
            );
        }
    }

    /// 워커의 조립 결과
    pub(crate) fn on_assembled(
        &mut self,
        transfer_id: &str,
        result: std::result::Result<PathBuf, FailureReason>,
    ) {
        if !self.sessions.is_active(transfer_id) {
            // 조립 중에 취소된 전송
            if let Ok(path) = result {
                debug!("종료된 전송의 조립 결과 삭제: {}", path.display());
                self.submit(StorageJob::RemoveArtifact { path });
            }
            return;
        }

        match result {
            Ok(path) => {
                let Some(snapshot) = self.finish(transfer_id, Outcome::Completed, Some(path))
                else {
                    return;
                };
                self.delegate
                    .on_transfer_complete(transfer_id, &snapshot.sender_id);
                self.broadcast_message(&Message::Complete(transfer_id.to_string()));
            }
            Err(reason) => {
                error!("조립 실패: {}: {}", transfer_id, reason);
                self.fail(transfer_id, reason);
            }
        }
    }
}
