//! # MPT (Mesh Photo Transfer)
//!
//! 손실이 많은 브로드캐스트 전용 링크(메시 라디오) 위의 청크 기반 대용량 전송 계층
//!
//! ## 핵심 특징
//! - **고정 크기 청크**: 바이트 스트림을 256바이트 청크로 분할, 인덱스 순서로 조립
//! - **NACK 기반**: ACK 없이 누락 청크만 재전송 요청 (쿨다운 적용)
//! - **페이싱**: 고정 간격 순차 전송으로 링크 처리량 보호
//! - **타임아웃/재시도**: 청크별 재시도 타이머 + 전송 전체 데드라인 + 비활성 감시
//! - **무결성**: SHA-256 전체 다이제스트로 조립 결과 검증
//! - **단일 작성자**: 모든 세션 상태는 하나의 엔진 태스크에서만 변경

pub mod chunk;
pub mod config;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod message;
mod receiver;
pub mod scheduler;
mod sender;
pub mod session;
pub mod stats;
pub mod store;
pub mod transport;
mod worker;

pub use chunk::{Checksum, Chunk, ChunkIndex, ChunkSplitter, TransferId, TransferMetadata};
pub use config::Config;
pub use delegate::{FsDelegate, TransferDelegate, TransferEvent};
pub use engine::{SendRequest, TransferEngine};
pub use error::{Error, FailureReason, Result, TimeoutCause};
pub use message::{Message, MessageType, PacketHeader, RetryRequest};
pub use scheduler::{RetryScheduler, TimerHandle, TimerKey, TimerKind};
pub use session::{SessionSnapshot, SessionStore, TransferRole, TransferSession, TransferStatus};
pub use stats::TransferStats;
pub use store::{ChunkStore, FileChunkStore, MemoryChunkStore};
pub use transport::{Transport, UdpTransport};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// ChunkData 페이로드 최대 크기 (바이트)
pub const MAX_CHUNK_PAYLOAD_SIZE: usize = 65535;

/// RetryRequest 한 건에 담을 수 있는 최대 인덱스 수
pub const MAX_RETRY_INDICES: usize = 20;

/// 기본 홉 제한 (전송 계층이 해석, 코어는 전달만 함)
pub const DEFAULT_HOP_LIMIT: u8 = 3;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC_NUMBER: u32 = 0x4D505446; // "MPTF"
