//! 송신 처리
//!
//! - 메타데이터 브로드캐스트 후 고정 간격 순차 전송 (페이싱)
//! - 청크별 재시도 타이머, 지터 후 재전송
//! - 재전송 요청(NACK) 처리: 인덱스마다 간격을 두고 재전송
//!
//! 청크 바이트는 저장소에 먼저 기록되고 보낼 때마다 워커가 다시 읽어옴

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chunk::{generate_transfer_id, Chunk, ChunkIndex, ChunkSplitter, TransferId, TransferMetadata};
use crate::delegate::TransferEvent;
use crate::engine::{EngineInner, SendRequest, TimerEvent};
use crate::message::{Message, RetryRequest};
use crate::scheduler::TimerKind;
use crate::session::{TransferRole, TransferSession};
use crate::store::{chunk_key, metadata_key};
use crate::worker::{SendKind, StorageJob};
use crate::{FailureReason, Result, MAX_RETRY_INDICES};

impl EngineInner {
    /// 새 송신 전송 시작
    pub(crate) fn start_send(&mut self, request: SendRequest) -> Result<TransferId> {
        let transfer_id = generate_transfer_id();
        let metadata = TransferMetadata::new(
            transfer_id.clone(),
            request.file_name,
            self.node_id.as_str(),
            &request.data,
            self.config.chunk_size,
            request.original_size,
        )?;
        let metadata_bytes = bincode::serialize(&metadata)?;

        // 청크 저장은 워커에서. 첫 전송 전에 끝남 (FIFO)
        self.submit(StorageJob::Put {
            transfer_id: transfer_id.clone(),
            key: metadata_key(&transfer_id),
            bytes: metadata_bytes,
        });
        for chunk in ChunkSplitter::new(self.config.chunk_size).split(&transfer_id, &request.data) {
            self.submit(StorageJob::Put {
                transfer_id: transfer_id.clone(),
                key: chunk_key(&transfer_id, chunk.index),
                bytes: chunk.data.to_vec(),
            });
        }

        info!(
            "송신 시작: {} ({}, {} bytes, {} 청크, 압축률 {:.2})",
            transfer_id,
            metadata.file_name,
            metadata.total_size,
            metadata.total_chunks,
            metadata.compression_ratio
        );

        self.sessions
            .create(TransferSession::outgoing(metadata.clone(), Instant::now()));
        self.stats.outgoing_transfers += 1;
        self.emit(TransferEvent::Started {
            transfer_id: transfer_id.clone(),
            role: TransferRole::Outgoing,
            file_name: metadata.file_name.clone(),
            total_chunks: metadata.total_chunks,
        });

        self.broadcast_message(&Message::Metadata(metadata));

        // 첫 청크도 한 간격 뒤에 전송
        self.schedule(
            &transfer_id,
            TimerKind::Pacing,
            self.config.chunk_interval(),
            TimerEvent::SendNext {
                transfer_id: transfer_id.clone(),
                chunk_index: 0,
            },
        );

        Ok(transfer_id)
    }

    /// 페이싱 타이머: 다음 청크 읽기 요청
    pub(crate) fn on_send_next(&mut self, transfer_id: &str, chunk_index: ChunkIndex) {
        let Some(session) = self.sessions.get(transfer_id) else {
            debug!("종료된 전송, 순차 전송 중단: {}", transfer_id);
            return;
        };
        if chunk_index >= session.metadata().total_chunks {
            return;
        }

        self.submit(StorageJob::Load {
            transfer_id: transfer_id.to_string(),
            chunk_index,
            kind: SendKind::Initial,
        });
    }

    /// 저장소에서 청크를 읽어온 뒤 실제 전송
    pub(crate) fn on_chunk_loaded(
        &mut self,
        transfer_id: &str,
        chunk_index: ChunkIndex,
        kind: SendKind,
        data: Result<Option<Vec<u8>>>,
    ) {
        let total_chunks = match self.sessions.get(transfer_id) {
            Some(session) if session.role() == TransferRole::Outgoing => {
                session.metadata().total_chunks
            }
            // 읽는 사이에 취소/완료됨
            _ => return,
        };

        let sent = match data {
            Ok(Some(bytes)) => {
                let len = bytes.len() as u64;
                let chunk = Chunk::new(
                    transfer_id.to_string(),
                    chunk_index,
                    Bytes::from(bytes),
                    chunk_index + 1 == total_chunks,
                );
                let sent = self.broadcast_message(&Message::Chunk(chunk));
                if sent {
                    self.stats.bytes_sent += len;
                }
                sent
            }
            Ok(None) => {
                error!("저장된 청크 없음: {} #{}", transfer_id, chunk_index);
                false
            }
            Err(e) => {
                error!("청크 읽기 실패: {} #{}: {}", transfer_id, chunk_index, e);
                false
            }
        };

        if sent {
            if let Some(session) = self.sessions.get_mut(transfer_id) {
                session.record_send(Instant::now());
            }
            let retransmit = kind == SendKind::Retransmit;
            if retransmit {
                self.stats.retransmitted_chunks += 1;
            } else {
                self.stats.chunks_sent += 1;
            }
            self.emit(TransferEvent::ChunkSent {
                transfer_id: transfer_id.to_string(),
                chunk_index,
                retransmit,
            });
        }

        // 전송 실패도 재시도 대상
        self.schedule(
            transfer_id,
            TimerKind::ChunkRetry(chunk_index),
            self.config.chunk_retry_timeout(),
            TimerEvent::ChunkRetry {
                transfer_id: transfer_id.to_string(),
                chunk_index,
            },
        );

        if kind == SendKind::Initial && chunk_index + 1 < total_chunks {
            self.schedule(
                transfer_id,
                TimerKind::Pacing,
                self.config.chunk_interval(),
                TimerEvent::SendNext {
                    transfer_id: transfer_id.to_string(),
                    chunk_index: chunk_index + 1,
                },
            );
        }
    }

    /// 청크 재시도 타이머 만료
    ///
    /// 완료 알림을 받기 전까지는 수신 여부를 알 수 없으므로 청크마다 그대로 재전송됨
    pub(crate) fn on_chunk_retry_timeout(&mut self, transfer_id: &str, chunk_index: ChunkIndex) {
        let max_retries = self.config.max_chunk_retries;
        let Some(session) = self.sessions.get_mut(transfer_id) else {
            return;
        };
        if session.role() != TransferRole::Outgoing {
            return;
        }

        if session.retry_count(chunk_index) >= max_retries {
            warn!(
                "청크 재시도 한도 도달: {} #{} ({}회)",
                transfer_id, chunk_index, max_retries
            );
            self.fail(transfer_id, FailureReason::RetryExhausted { chunk_index });
            return;
        }

        let attempt = session.increment_retry(chunk_index);
        debug!(
            "청크 재시도 {}/{}: {} #{}",
            attempt, max_retries, transfer_id, chunk_index
        );
        self.schedule(
            transfer_id,
            TimerKind::Retransmit(chunk_index),
            self.config.retransmit_jitter(),
            TimerEvent::Retransmit {
                transfer_id: transfer_id.to_string(),
                chunk_index,
            },
        );
    }

    /// 재전송 타이머: 청크 읽기 요청
    pub(crate) fn on_retransmit(&mut self, transfer_id: &str, chunk_index: ChunkIndex) {
        match self.sessions.get(transfer_id) {
            Some(session)
                if session.role() == TransferRole::Outgoing
                    && chunk_index < session.metadata().total_chunks => {}
            _ => return,
        }

        self.submit(StorageJob::Load {
            transfer_id: transfer_id.to_string(),
            chunk_index,
            kind: SendKind::Retransmit,
        });
    }

    /// 수신측 재전송 요청 처리
    ///
    /// k번째 인덱스는 k × 지터 후 재전송. 범위 밖 인덱스는 무시
    pub(crate) fn on_retry_request(&mut self, request: RetryRequest, from: &str) {
        let total_chunks = match self.sessions.get(&request.transfer_id) {
            Some(session) if session.role() == TransferRole::Outgoing => {
                session.metadata().total_chunks
            }
            Some(_) => return,
            None => {
                debug!(
                    "알 수 없는 전송의 재전송 요청: {} from {}",
                    request.transfer_id, from
                );
                return;
            }
        };

        self.stats.retry_requests_received += 1;
        debug!(
            "재전송 요청 수신: {} from {}, {:?}",
            request.transfer_id, from, request.missing_chunk_ids
        );

        let jitter = self.config.retransmit_jitter();
        let indices = request
            .missing_chunk_ids
            .iter()
            .copied()
            .filter(|&index| index < total_chunks)
            .take(MAX_RETRY_INDICES);
        for (k, chunk_index) in indices.enumerate() {
            self.schedule(
                &request.transfer_id,
                TimerKind::Retransmit(chunk_index),
                jitter * k as u32,
                TimerEvent::Retransmit {
                    transfer_id: request.transfer_id.clone(),
                    chunk_index,
                },
            );
        }
    }
}

