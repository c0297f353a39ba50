//! 프로토콜 메시지 정의
//!
//! 다섯 가지 메시지가 하나의 엔벨로프를 공유함
//! `u16 헤더 길이 | bincode PacketHeader | 페이로드`

use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, ChunkIndex, TransferId, TransferMetadata};
use crate::{
    Error, Result, MAGIC_NUMBER, MAX_CHUNK_PAYLOAD_SIZE, MAX_RETRY_INDICES, PROTOCOL_VERSION,
};

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// 전송 시작 (메타데이터)
    MetadataStart = 1,

    /// 데이터 청크
    ChunkData = 2,

    /// 전송 완료 알림
    Complete = 3,

    /// 전송 취소 알림
    Cancel = 4,

    /// 누락 청크 재전송 요청 (NACK)
    RetryRequest = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::MetadataStart),
            2 => Ok(MessageType::ChunkData),
            3 => Ok(MessageType::Complete),
            4 => Ok(MessageType::Cancel),
            5 => Ok(MessageType::RetryRequest),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// 패킷 헤더
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 메시지 타입 (`MessageType` 값)
    pub msg_type: u8,

    /// 홉 제한 (전송 계층 소유, 코어는 그대로 전달)
    pub hop_limit: u8,

    /// 송신 노드 ID
    pub sender_id: String,

    /// 페이로드 길이 (헤더 제외)
    pub payload_len: u32,
}

impl PacketHeader {
    pub fn new(msg_type: MessageType, hop_limit: u8, sender_id: &str, payload_len: u32) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            msg_type: msg_type as u8,
            hop_limit,
            sender_id: sender_id.to_string(),
            payload_len,
        }
    }

    /// 메시지 타입 해석
    pub fn message_type(&self) -> Result<MessageType> {
        MessageType::try_from(self.msg_type)
    }
}

/// 재전송 요청 메시지 (누락 청크 NACK)
///
/// 수신측에서 송신측으로 보내는 유일한 피드백. 링크 부담을 줄이기 위해
/// 한 번에 최대 20개 인덱스만 실음
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRequest {
    /// 전송 ID
    pub transfer_id: TransferId,

    /// 누락된 청크 인덱스 (오름차순)
    pub missing_chunk_ids: Vec<ChunkIndex>,
}

impl RetryRequest {
    pub fn new(transfer_id: TransferId, mut missing_chunk_ids: Vec<ChunkIndex>) -> Self {
        missing_chunk_ids.truncate(MAX_RETRY_INDICES);
        Self {
            transfer_id,
            missing_chunk_ids,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransferNotice {
    transfer_id: TransferId,
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Metadata(TransferMetadata),
    Chunk(Chunk),
    Complete(TransferId),
    Cancel(TransferId),
    RetryRequest(RetryRequest),
}

impl Message {
    /// 메시지 타입 반환
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Metadata(_) => MessageType::MetadataStart,
            Message::Chunk(_) => MessageType::ChunkData,
            Message::Complete(_) => MessageType::Complete,
            Message::Cancel(_) => MessageType::Cancel,
            Message::RetryRequest(_) => MessageType::RetryRequest,
        }
    }

    /// 대상 전송 ID
    pub fn transfer_id(&self) -> &str {
        match self {
            Message::Metadata(metadata) => &metadata.transfer_id,
            Message::Chunk(chunk) => &chunk.transfer_id,
            Message::Complete(id) | Message::Cancel(id) => id,
            Message::RetryRequest(request) => &request.transfer_id,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Metadata(metadata) => bincode::serialize(metadata)?,
            Message::Chunk(chunk) => chunk.to_bytes()?,
            Message::Complete(id) | Message::Cancel(id) => bincode::serialize(&TransferNotice {
                transfer_id: id.clone(),
            })?,
            Message::RetryRequest(request) => bincode::serialize(request)?,
        };

        if self.msg_type() == MessageType::ChunkData && payload.len() > MAX_CHUNK_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: MAX_CHUNK_PAYLOAD_SIZE,
            });
        }

        Ok(payload)
    }

    /// 패킷으로 직렬화
    pub fn to_bytes(&self, sender_id: &str, hop_limit: u8) -> Result<Vec<u8>> {
        let payload = self.encode_payload()?;
        let header = PacketHeader::new(self.msg_type(), hop_limit, sender_id, payload.len() as u32);
        let header_bytes = bincode::serialize(&header)?;
        let header_len = u16::try_from(header_bytes.len()).map_err(|_| Error::PayloadTooLarge {
            size: header_bytes.len(),
            max: u16::MAX as usize,
        })?;

        let mut buf = Vec::with_capacity(2 + header_bytes.len() + payload.len());
        buf.extend_from_slice(&header_len.to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// 패킷에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<(PacketHeader, Message)> {
        if bytes.len() < 2 {
            return Err(Error::MalformedPacket(format!("패킷 너무 짧음: {} bytes", bytes.len())));
        }

        let header_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + header_len {
            return Err(Error::MalformedPacket("헤더 잘림".into()));
        }

        let header: PacketHeader = bincode::deserialize(&bytes[2..2 + header_len])?;
        if header.magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: header.magic,
            });
        }
        if header.version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: header.version,
            });
        }

        let payload = &bytes[2 + header_len..];
        if payload.len() != header.payload_len as usize {
            return Err(Error::MalformedPacket(format!(
                "페이로드 길이 불일치: expected {}, got {}",
                header.payload_len,
                payload.len()
            )));
        }

        let message = match header.message_type()? {
            MessageType::MetadataStart => Message::Metadata(bincode::deserialize(payload)?),
            MessageType::ChunkData => Message::Chunk(Chunk::from_bytes(payload)?),
            MessageType::Complete => {
                let notice: TransferNotice = bincode::deserialize(payload)?;
                Message::Complete(notice.transfer_id)
            }
            MessageType::Cancel => {
                let notice: TransferNotice = bincode::deserialize(payload)?;
                Message::Cancel(notice.transfer_id)
            }
            MessageType::RetryRequest => Message::RetryRequest(bincode::deserialize(payload)?),
        };

        Ok((header, message))
    }
}
