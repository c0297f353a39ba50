//! 외부 협력자 인터페이스와 관찰자 이벤트

use std::path::{Path, PathBuf};

use tracing::info;

use crate::chunk::{ChunkIndex, TransferId};
use crate::session::TransferRole;
use crate::FailureReason;

/// 전송 결과를 받는 외부 대리자
///
/// 엔진 생성 시 주입되며 엔진 태스크에서 호출되므로 오래 걸리는 작업을 하면 안 됨
pub trait TransferDelegate: Send + Sync {
    /// 조립된 최종 파일을 저장할 경로
    fn resolve_storage_path(&self, transfer_id: &str, file_name: &str) -> PathBuf;

    /// 전송 완료 (수신측: 검증 후 저장 완료, 송신측: 원격 완료 알림 수신)
    fn on_transfer_complete(&self, transfer_id: &str, sender_id: &str);

    /// 원격 취소
    fn on_transfer_cancelled(&self, transfer_id: &str, peer_id: &str);
}

/// 관찰자 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started {
        transfer_id: TransferId,
        role: TransferRole,
        file_name: String,
        total_chunks: u32,
    },
    Progress {
        transfer_id: TransferId,
        received: u32,
        total: u32,
    },
    ChunkSent {
        transfer_id: TransferId,
        chunk_index: ChunkIndex,
        retransmit: bool,
    },
    RetryRequested {
        transfer_id: TransferId,
        missing: Vec<ChunkIndex>,
    },
    Completed {
        transfer_id: TransferId,
        path: Option<PathBuf>,
    },
    Failed {
        transfer_id: TransferId,
        reason: FailureReason,
    },
    Cancelled {
        transfer_id: TransferId,
        reason: FailureReason,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &str {
        match self {
            TransferEvent::Started { transfer_id, .. }
            | TransferEvent::Progress { transfer_id, .. }
            | TransferEvent::ChunkSent { transfer_id, .. }
            | TransferEvent::RetryRequested { transfer_id, .. }
            | TransferEvent::Completed { transfer_id, .. }
            | TransferEvent::Failed { transfer_id, .. }
            | TransferEvent::Cancelled { transfer_id, .. } => transfer_id,
        }
    }

    /// 종료 이벤트 여부
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Completed { .. }
                | TransferEvent::Failed { .. }
                | TransferEvent::Cancelled { .. }
        )
    }
}

/// 출력 디렉터리에 저장하는 기본 대리자
pub struct FsDelegate {
    output_dir: PathBuf,
}

impl FsDelegate {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// 경로 구분자 등 위험한 문자를 제거한 파일 이름
fn sanitize_file_name(file_name: &str) -> String {
    let name: String = file_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    let name = name.trim_start_matches('.');
    if name.is_empty() {
        "unnamed".to_string()
    } else {
        name.to_string()
    }
}

impl TransferDelegate for FsDelegate {
    fn resolve_storage_path(&self, transfer_id: &str, file_name: &str) -> PathBuf {
        let short_id: String = transfer_id.chars().take(8).collect();
        self.output_dir
            .join(format!("{}_{}", short_id, sanitize_file_name(file_name)))
    }

    fn on_transfer_complete(&self, transfer_id: &str, sender_id: &str) {
        info!("전송 완료: transfer={}, sender={}", transfer_id, sender_id);
    }

    fn on_transfer_cancelled(&self, transfer_id: &str, peer_id: &str) {
        info!("전송 취소됨: transfer={}, peer={}", transfer_id, peer_id);
    }
}
