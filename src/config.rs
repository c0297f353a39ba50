//! 프로토콜 설정

use std::time::Duration;

use crate::{Error, Result, DEFAULT_CHUNK_SIZE, DEFAULT_HOP_LIMIT, MAX_RETRY_INDICES};

/// MPT 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 청크 크기 (바이트)
    pub chunk_size: usize,

    /// 송신 패킷에 기록하는 홉 제한
    pub hop_limit: u8,

    /// 청크 전송 간격 (밀리초)
    pub chunk_interval_ms: u64,

    /// 청크 재시도 타이머 (밀리초)
    /// 전송(최초/재전송) 직후마다 다시 설정됨
    pub chunk_retry_timeout_ms: u64,

    /// 청크당 최대 재시도 횟수
    pub max_chunk_retries: u32,

    /// 재전송 지터 / 재전송 요청 항목 간 간격 (밀리초)
    pub retransmit_jitter_ms: u64,

    /// 수신측 전송 전체 데드라인 (밀리초)
    pub transfer_timeout_ms: u64,

    /// 비활성 감시 타임아웃 (밀리초)
    pub inactivity_timeout_ms: u64,

    /// 이 개수를 넘게 누락되면 실패 후보
    pub missing_chunk_threshold: usize,

    /// 누락 과다 상태로 허용하는 비활성 시간 (밀리초)
    pub missing_chunk_timeout_ms: u64,

    /// 비활성 이후 재전송 요청까지 대기 (밀리초)
    pub nack_delay_ms: u64,

    /// 재전송 요청 간 최소 간격 (밀리초)
    pub nack_cooldown_ms: u64,

    /// 이 진행률을 넘으면 비활성과 무관하게 재전송 요청
    pub nack_progress_threshold: f64,

    /// 재전송 요청당 최대 인덱스 수
    pub max_nack_indices: usize,

    /// 진행 모니터 주기 (밀리초)
    pub monitor_interval_ms: u64,

    /// 엔진 명령 채널 크기
    pub command_buffer_size: usize,

    /// 이벤트 채널 크기
    pub event_buffer_size: usize,

    /// 보관하는 종료 세션 스냅샷 수 (오래된 것부터 제거)
    pub finished_history_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            hop_limit: DEFAULT_HOP_LIMIT,
            chunk_interval_ms: 100,             // 100ms
            chunk_retry_timeout_ms: 30_000,     // 30초
            max_chunk_retries: 3,
            retransmit_jitter_ms: 50,           // 50ms
            transfer_timeout_ms: 300_000,       // 5분
            inactivity_timeout_ms: 60_000,      // 1분
            missing_chunk_threshold: 10,
            missing_chunk_timeout_ms: 30_000,   // 30초
            nack_delay_ms: 10_000,              // 10초
            nack_cooldown_ms: 5_000,            // 5초
            nack_progress_threshold: 0.9,
            max_nack_indices: MAX_RETRY_INDICES,
            monitor_interval_ms: 10_000,        // 10초
            command_buffer_size: 1000,
            event_buffer_size: 256,
            finished_history_size: 1024,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    pub fn chunk_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_retry_timeout_ms)
    }

    pub fn retransmit_jitter(&self) -> Duration {
        Duration::from_millis(self.retransmit_jitter_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn missing_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.missing_chunk_timeout_ms)
    }

    pub fn nack_delay(&self) -> Duration {
        Duration::from_millis(self.nack_delay_ms)
    }

    pub fn nack_cooldown(&self) -> Duration {
        Duration::from_millis(self.nack_cooldown_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// 설정값 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size는 0일 수 없음".into()));
        }
        if self.chunk_size > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "chunk_size {} 는 {} 이하여야 함",
                self.chunk_size,
                u16::MAX
            )));
        }
        if self.max_nack_indices == 0 || self.max_nack_indices > MAX_RETRY_INDICES {
            return Err(Error::InvalidConfig(format!(
                "max_nack_indices는 1..={} 범위여야 함",
                MAX_RETRY_INDICES
            )));
        }
        if !(0.0..=1.0).contains(&self.nack_progress_threshold) {
            return Err(Error::InvalidConfig(
                "nack_progress_threshold는 0.0 ~ 1.0 범위여야 함".into(),
            ));
        }
        if self.monitor_interval_ms == 0 || self.command_buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "monitor_interval_ms / command_buffer_size는 0일 수 없음".into(),
            ));
        }
        Ok(())
    }

    /// 장거리/혼잡 메시용 설정
    pub fn long_range() -> Self {
        Self {
            hop_limit: 5,
            chunk_interval_ms: 250,             // 더 느린 페이싱
            chunk_retry_timeout_ms: 60_000,
            retransmit_jitter_ms: 120,
            transfer_timeout_ms: 900_000,       // 15분
            inactivity_timeout_ms: 120_000,
            missing_chunk_timeout_ms: 60_000,
            nack_delay_ms: 20_000,
            nack_cooldown_ms: 10_000,
            monitor_interval_ms: 15_000,
            ..Self::default()
        }
    }

    /// 근거리 저지연 링크용 설정
    pub fn low_latency() -> Self {
        Self {
            hop_limit: 1,
            chunk_interval_ms: 20,
            chunk_retry_timeout_ms: 5_000,
            retransmit_jitter_ms: 10,
            transfer_timeout_ms: 60_000,
            inactivity_timeout_ms: 15_000,
            missing_chunk_timeout_ms: 8_000,
            nack_delay_ms: 2_000,
            nack_cooldown_ms: 1_000,
            monitor_interval_ms: 2_000,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::long_range().validate().is_ok());
        assert!(Config::low_latency().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config {
            max_nack_indices: 21,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
