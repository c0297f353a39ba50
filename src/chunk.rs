//! 청크와 전송 메타데이터 정의
//!
//! - TransferMetadata: 전송 하나의 불변 정보 (크기, 체크섬, 청크 수)
//! - Chunk: 브로드캐스트 패킷 하나에 실리는 고정 크기 조각 (256 bytes)

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// 전송 ID (불투명 고유 문자열)
pub type TransferId = String;

/// 청크 인덱스 (0부터 시작, 빈틈 없음)
pub type ChunkIndex = u32;

/// SHA-256 다이제스트 (256비트)
pub type Checksum = [u8; 32];

/// 전체 바이트 스트림의 SHA-256 계산
pub fn checksum(data: &[u8]) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// 새 전송 ID 생성 (128비트 난수, hex)
pub fn generate_transfer_id() -> TransferId {
    hex::encode(rand::random::<[u8; 16]>())
}

/// 길이와 청크 크기로 총 청크 수 계산 (ceil)
///
/// 결과가 u32 범위를 넘으면 None
pub fn total_chunks_for(len: u64, chunk_size: usize) -> Option<u32> {
    let chunk_size = chunk_size.max(1) as u64;
    u32::try_from(len.div_ceil(chunk_size)).ok()
}

/// 전송 메타데이터
///
/// 생성 이후 변경되지 않음
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// 전송 ID
    pub transfer_id: TransferId,

    /// 파일 이름
    pub file_name: String,

    /// 선언된 전체 크기 (바이트)
    pub total_size: u64,

    /// 전체 스트림 SHA-256
    pub checksum: Checksum,

    /// 송신 노드 ID
    pub sender_id: String,

    /// 총 청크 수
    pub total_chunks: u32,

    /// 청크 크기
    pub chunk_size: u32,

    /// 압축 전 원본 크기 (정보용)
    pub original_size: u64,

    /// 압축 후 크기 (정보용)
    pub compressed_size: u64,

    /// 압축률 (compressed / original)
    pub compression_ratio: f64,
}

impl TransferMetadata {
    /// 전송할 데이터로부터 메타데이터 생성
    ///
    /// `original_size`는 외부 코덱이 알려준 압축 전 크기. 없으면 데이터 크기와 같다고 봄
    pub fn new(
        transfer_id: TransferId,
        file_name: impl Into<String>,
        sender_id: impl Into<String>,
        data: &[u8],
        chunk_size: usize,
        original_size: Option<u64>,
    ) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if chunk_size == 0 || chunk_size > u32::MAX as usize {
            return Err(Error::InvalidMetadata(format!(
                "chunk_size 범위 밖: {}",
                chunk_size
            )));
        }

        let total_size = data.len() as u64;
        let total_chunks = total_chunks_for(total_size, chunk_size).ok_or_else(|| {
            Error::InvalidMetadata(format!("청크 수가 u32 범위를 넘음: {} bytes", total_size))
        })?;
        let original_size = original_size.unwrap_or(total_size);
        let compression_ratio = if original_size == 0 {
            1.0
        } else {
            total_size as f64 / original_size as f64
        };

        Ok(Self {
            transfer_id,
            file_name: file_name.into(),
            total_size,
            checksum: checksum(data),
            sender_id: sender_id.into(),
            total_chunks,
            chunk_size: chunk_size as u32,
            original_size,
            compressed_size: total_size,
            compression_ratio,
        })
    }

    /// 수신한 메타데이터 검증
    pub fn validate(&self) -> Result<()> {
        if self.transfer_id.is_empty() {
            return Err(Error::InvalidMetadata("빈 transfer_id".into()));
        }
        if self.chunk_size == 0 || self.total_size == 0 {
            return Err(Error::InvalidMetadata(format!(
                "chunk_size={}, total_size={}",
                self.chunk_size, self.total_size
            )));
        }
        // total_chunks == ceil(total_size / chunk_size) 이면
        // total_size <= total_chunks * chunk_size 도 함께 성립
        match total_chunks_for(self.total_size, self.chunk_size as usize) {
            Some(expected) if expected == self.total_chunks => {}
            Some(expected) => {
                return Err(Error::InvalidMetadata(format!(
                    "total_chunks 불일치: expected {}, got {}",
                    expected, self.total_chunks
                )))
            }
            None => {
                return Err(Error::InvalidMetadata(format!(
                    "청크 수가 u32 범위를 넘음: total_size={}, chunk_size={}",
                    self.total_size, self.chunk_size
                )))
            }
        }
        Ok(())
    }

    /// 체크섬 hex 문자열
    pub fn checksum_hex(&self) -> String {
        hex::encode(self.checksum)
    }

    /// 인덱스에 해당하는 청크의 예상 길이
    pub fn expected_chunk_len(&self, index: ChunkIndex) -> Option<usize> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = index as u64 * self.chunk_size as u64;
        Some((self.total_size - offset).min(self.chunk_size as u64) as usize)
    }
}

/// 청크 와이어 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkHeader {
    transfer_id: TransferId,
    chunk_index: ChunkIndex,
    is_last_chunk: bool,
    data_len: u16,
    crc32: u32,
}

/// 청크 (송신 패킷 단위)
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// 전송 ID
    pub transfer_id: TransferId,

    /// 청크 인덱스
    pub index: ChunkIndex,

    /// 실제 데이터
    pub data: Bytes,

    /// 마지막 청크 여부
    pub is_last_chunk: bool,
}

impl Chunk {
    /// 새 청크 생성
    pub fn new(transfer_id: TransferId, index: ChunkIndex, data: Bytes, is_last_chunk: bool) -> Self {
        Self {
            transfer_id,
            index,
            data,
            is_last_chunk,
        }
    }

    /// 청크를 바이트로 직렬화
    ///
    /// `u16 헤더 길이 | bincode 헤더 | 데이터`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge {
                size: self.data.len(),
                max: u16::MAX as usize,
            });
        }

        let header = ChunkHeader {
            transfer_id: self.transfer_id.clone(),
            chunk_index: self.index,
            is_last_chunk: self.is_last_chunk,
            data_len: self.data.len() as u16,
            crc32: crc32fast::hash(&self.data),
        };
        let header_bytes = bincode::serialize(&header)?;
        if header_bytes.len() > u16::MAX as usize {
            return Err(Error::PayloadTooLarge {
                size: header_bytes.len(),
                max: u16::MAX as usize,
            });
        }
        let header_len = header_bytes.len() as u16;

        let mut buf = Vec::with_capacity(2 + header_bytes.len() + self.data.len());
        buf.extend_from_slice(&header_len.to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// 바이트에서 청크 역직렬화 (CRC 검증 포함)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::MalformedPacket("청크 헤더 길이 누락".into()));
        }

        let header_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + header_len {
            return Err(Error::MalformedPacket(format!(
                "청크 헤더 잘림: {} < {}",
                bytes.len(),
                2 + header_len
            )));
        }

        let header: ChunkHeader = bincode::deserialize(&bytes[2..2 + header_len])?;
        let data = &bytes[2 + header_len..];
        if data.len() != header.data_len as usize {
            return Err(Error::MalformedPacket(format!(
                "청크 데이터 길이 불일치: expected {}, got {}",
                header.data_len,
                data.len()
            )));
        }

        let crc = crc32fast::hash(data);
        if crc != header.crc32 {
            return Err(Error::CrcMismatch {
                expected: header.crc32,
                got: crc,
            });
        }

        Ok(Self {
            transfer_id: header.transfer_id,
            index: header.chunk_index,
            data: Bytes::copy_from_slice(data),
            is_last_chunk: header.is_last_chunk,
        })
    }
}

/// 청크 분할기 (송신측)
pub struct ChunkSplitter {
    chunk_size: usize,
}

impl ChunkSplitter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// 데이터를 청크들로 분할 (패딩 없음)
    pub fn split(&self, transfer_id: &str, data: &[u8]) -> Vec<Chunk> {
        let total_chunks = data.len().div_ceil(self.chunk_size);

        data.chunks(self.chunk_size)
            .enumerate()
            .map(|(idx, chunk_data)| {
                Chunk::new(
                    transfer_id.to_string(),
                    idx as ChunkIndex,
                    Bytes::copy_from_slice(chunk_data),
                    idx + 1 == total_chunks,
                )
            })
            .collect()
    }
}

/// 저장된 청크들을 인덱스 순서로 이어 붙이고 체크섬 검증
///
/// `lookup`은 인덱스별 저장된 바이트를 반환. 빠진 인덱스가 있거나
/// 결과 다이제스트가 메타데이터와 다르면 실패하며 자동 재시도는 없음
pub fn assemble<F>(metadata: &TransferMetadata, mut lookup: F) -> Result<Bytes>
where
    F: FnMut(ChunkIndex) -> Result<Option<Vec<u8>>>,
{
    // 선언된 크기는 원격에서 온 값이므로 미리 할당하지 않음
    let mut buf = BytesMut::new();

    for index in 0..metadata.total_chunks {
        match lookup(index)? {
            Some(data) => {
                if buf.len() as u64 + data.len() as u64 > metadata.total_size {
                    return Err(Error::ChecksumMismatch {
                        transfer_id: metadata.transfer_id.clone(),
                    });
                }
                buf.extend_from_slice(&data);
            }
            None => {
                return Err(Error::MissingChunkAtAssembly {
                    transfer_id: metadata.transfer_id.clone(),
                    chunk_index: index,
                })
            }
        }
    }

    if checksum(&buf) != metadata.checksum {
        return Err(Error::ChecksumMismatch {
            transfer_id: metadata.transfer_id.clone(),
        });
    }

    Ok(buf.freeze())
}
