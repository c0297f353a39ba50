//! 저장소 작업 워커
//!
//! 청크 저장, 재전송용 청크 읽기, 최종 조립/체크섬/파일 쓰기, 정리 작업을
//! 엔진 태스크 밖(블로킹 풀)에서 처리함. 작업은 제출 순서대로 하나씩 실행되므로
//! 저장 직후 조립을 요청해도 앞선 저장이 먼저 끝남

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::chunk::{assemble, ChunkIndex, TransferId, TransferMetadata};
use crate::store::{chunk_key, transfer_prefix, ChunkStore};
use crate::{Error, FailureReason, Result};

/// 청크 전송 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendKind {
    /// 최초 순차 전송
    Initial,
    /// 타이머/재전송 요청에 의한 재전송
    Retransmit,
}

/// 워커 작업
#[derive(Debug)]
pub(crate) enum StorageJob {
    Put {
        transfer_id: TransferId,
        key: String,
        bytes: Vec<u8>,
    },
    Load {
        transfer_id: TransferId,
        chunk_index: ChunkIndex,
        kind: SendKind,
    },
    Assemble {
        metadata: TransferMetadata,
        path: PathBuf,
    },
    DeleteTransfer {
        transfer_id: TransferId,
    },
    /// 종료된 전송의 조립 결과 파일 삭제
    RemoveArtifact {
        path: PathBuf,
    },
}

/// 엔진으로 돌아가는 작업 결과
#[derive(Debug)]
pub(crate) enum StorageOutcome {
    PutFailed {
        transfer_id: TransferId,
        key: String,
        error: String,
    },
    ChunkLoaded {
        transfer_id: TransferId,
        chunk_index: ChunkIndex,
        kind: SendKind,
        data: Result<Option<Vec<u8>>>,
    },
    Assembled {
        transfer_id: TransferId,
        result: std::result::Result<PathBuf, FailureReason>,
    },
}

/// 워커 핸들
pub(crate) struct StorageWorker {
    tx: mpsc::UnboundedSender<StorageJob>,
}

impl StorageWorker {
    /// 워커 태스크 시작. 결과 수신기를 함께 반환
    pub(crate) fn spawn(
        store: Arc<dyn ChunkStore>,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<StorageOutcome>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StorageJob>();
        let (outcome_tx, outcome_rx) = mpsc::channel::<StorageOutcome>(buffer);

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let store = store.clone();
                match tokio::task::spawn_blocking(move || run_job(store.as_ref(), job)).await {
                    Ok(Some(outcome)) => {
                        if outcome_tx.send(outcome).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => error!("저장소 작업 실패 (join): {}", e),
                }
            }
            debug!("저장소 워커 종료");
        });

        (Self { tx }, outcome_rx)
    }

    /// 작업 제출. 워커가 종료된 경우 false
    pub(crate) fn submit(&self, job: StorageJob) -> bool {
        self.tx.send(job).is_ok()
    }
}

fn run_job(store: &dyn ChunkStore, job: StorageJob) -> Option<StorageOutcome> {
    match job {
        StorageJob::Put {
            transfer_id,
            key,
            bytes,
        } => match store.put(&key, &bytes) {
            Ok(()) => None,
            Err(e) => Some(StorageOutcome::PutFailed {
                transfer_id,
                key,
                error: e.to_string(),
            }),
        },

        StorageJob::Load {
            transfer_id,
            chunk_index,
            kind,
        } => {
            let data = store.get(&chunk_key(&transfer_id, chunk_index));
            Some(StorageOutcome::ChunkLoaded {
                transfer_id,
                chunk_index,
                kind,
                data,
            })
        }

        StorageJob::Assemble { metadata, path } => {
            let transfer_id = metadata.transfer_id.clone();
            let result = assemble_and_write(store, &metadata, &path);
            Some(StorageOutcome::Assembled {
                transfer_id,
                result,
            })
        }

        StorageJob::DeleteTransfer { transfer_id } => {
            match store.delete_prefix(&transfer_prefix(&transfer_id)) {
                Ok(removed) => debug!("전송 {} 저장 항목 {}개 삭제", transfer_id, removed),
                Err(e) => warn!("전송 {} 저장 항목 삭제 실패: {}", transfer_id, e),
            }
            None
        }

        StorageJob::RemoveArtifact { path } => {
            match fs::remove_file(&path) {
                Ok(()) => debug!("조립 결과 삭제: {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("조립 결과 삭제 실패: {}: {}", path.display(), e),
            }
            None
        }
    }
}

/// 조립 + 체크섬 검증 + 최종 파일 쓰기 + 청크 삭제
fn assemble_and_write(
    store: &dyn ChunkStore,
    metadata: &TransferMetadata,
    path: &Path,
) -> std::result::Result<PathBuf, FailureReason> {
    let transfer_id = &metadata.transfer_id;

    let data = assemble(metadata, |index| store.get(&chunk_key(transfer_id, index))).map_err(
        |e| match e {
            Error::MissingChunkAtAssembly { chunk_index, .. } => {
                FailureReason::MissingChunkAtAssembly { chunk_index }
            }
            Error::ChecksumMismatch { .. } => FailureReason::ChecksumMismatch,
            other => FailureReason::StorageWriteFailure(format!("청크 읽기 실패: {}", other)),
        },
    )?;

    write_artifact(path, &data)
        .map_err(|e| FailureReason::StorageWriteFailure(format!("{}: {}", path.display(), e)))?;

    if let Err(e) = store.delete_prefix(&transfer_prefix(transfer_id)) {
        warn!("전송 {} 청크 정리 실패: {}", transfer_id, e);
    }

    Ok(path.to_path_buf())
}

fn write_artifact(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".part");
    let tmp = PathBuf::from(tmp_name);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
