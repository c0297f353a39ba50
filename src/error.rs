//! 에러 타입 정의

use thiserror::Error;

use crate::chunk::{ChunkIndex, TransferId};

/// MPT 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("알 수 없는 메시지 타입: {0}")]
    UnknownMessageType(u8),

    #[error("잘못된 패킷: {0}")]
    MalformedPacket(String),

    #[error("페이로드 크기 초과: {size} bytes (최대 {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("빈 데이터는 전송할 수 없음")]
    EmptyPayload,

    #[error("유효하지 않은 메타데이터: {0}")]
    InvalidMetadata(String),

    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),

    #[error("조립 중 청크 누락: transfer_id={transfer_id}, chunk_index={chunk_index}")]
    MissingChunkAtAssembly {
        transfer_id: TransferId,
        chunk_index: ChunkIndex,
    },

    #[error("체크섬 불일치: transfer_id={transfer_id}")]
    ChecksumMismatch { transfer_id: TransferId },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("저장소 에러: {0}")]
    Storage(String),

    #[error("알 수 없는 전송: {0}")]
    UnknownTransfer(TransferId),

    #[error("엔진 종료됨")]
    EngineStopped,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

/// 타임아웃 원인
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    /// 전송 전체 데드라인 초과
    Deadline,
    /// 일정 시간 동안 청크 도착 없음
    Inactivity,
}

impl std::fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutCause::Deadline => write!(f, "전송 데드라인 초과"),
            TimeoutCause::Inactivity => write!(f, "활동 없음"),
        }
    }
}

/// 세션 종료 사유
///
/// 세션에 저장되어 조회/이벤트로 노출되므로 `Clone` 가능해야 함
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureReason {
    #[error("전송 타임아웃: {0}")]
    TransferTimeout(TimeoutCause),

    #[error("누락 청크 과다: {missing}개 누락")]
    TooManyMissingChunks { missing: usize },

    #[error("청크 재시도 횟수 초과: chunk_index={chunk_index}")]
    RetryExhausted { chunk_index: ChunkIndex },

    #[error("체크섬 불일치")]
    ChecksumMismatch,

    #[error("조립 중 청크 누락: chunk_index={chunk_index}")]
    MissingChunkAtAssembly { chunk_index: ChunkIndex },

    #[error("최종 파일 저장 실패: {0}")]
    StorageWriteFailure(String),

    #[error("사용자 취소")]
    UserCancelled,

    #[error("송신자가 취소함")]
    CancelledBySender,
}
