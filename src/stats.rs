//! 전송 통계

use std::time::{Duration, Instant};

/// 엔진 전체 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 시작한 송신 전송 수
    pub outgoing_transfers: u64,

    /// 시작한 수신 전송 수
    pub incoming_transfers: u64,

    /// 완료된 전송 수
    pub completed_transfers: u64,

    /// 실패한 전송 수
    pub failed_transfers: u64,

    /// 취소된 전송 수
    pub cancelled_transfers: u64,

    /// 최초 전송한 청크 수
    pub chunks_sent: u64,

    /// 재전송한 청크 수
    pub retransmitted_chunks: u64,

    /// 송신 바이트 (청크 데이터 기준)
    pub bytes_sent: u64,

    /// 새로 수신한 청크 수
    pub chunks_received: u64,

    /// 수신 바이트 (청크 데이터 기준)
    pub bytes_received: u64,

    /// 중복 수신 청크 수
    pub duplicate_chunks: u64,

    /// 거부된 청크 수 (범위 밖, 길이 불일치, CRC 불일치)
    pub rejected_chunks: u64,

    /// 메타데이터 없이 도착해 폐기된 청크 수
    pub orphan_chunks: u64,

    /// 보낸 재전송 요청 수
    pub retry_requests_sent: u64,

    /// 받은 재전송 요청 수
    pub retry_requests_received: u64,

    /// 해석 실패 패킷 수
    pub malformed_packets: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            outgoing_transfers: 0,
            incoming_transfers: 0,
            completed_transfers: 0,
            failed_transfers: 0,
            cancelled_transfers: 0,
            chunks_sent: 0,
            retransmitted_chunks: 0,
            bytes_sent: 0,
            chunks_received: 0,
            bytes_received: 0,
            duplicate_chunks: 0,
            rejected_chunks: 0,
            orphan_chunks: 0,
            retry_requests_sent: 0,
            retry_requests_received: 0,
            malformed_packets: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 재전송 비율 (재전송 / 전체 송신 청크)
    pub fn retransmit_ratio(&self) -> f64 {
        let total = self.chunks_sent + self.retransmitted_chunks;
        if total == 0 {
            return 0.0;
        }
        self.retransmitted_chunks as f64 / total as f64
    }

    /// 중복 수신 비율
    pub fn duplicate_ratio(&self) -> f64 {
        let total = self.chunks_received + self.duplicate_chunks;
        if total == 0 {
            return 0.0;
        }
        self.duplicate_chunks as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Transfers: out {} / in {} | Done: {} ok, {} failed, {} cancelled | Chunks: sent {} (+{} retx), recv {} (+{} dup) | NACKs: {} sent / {} recv",
            self.elapsed().as_secs_f64(),
            self.outgoing_transfers,
            self.incoming_transfers,
            self.completed_transfers,
            self.failed_transfers,
            self.cancelled_transfers,
            self.chunks_sent,
            self.retransmitted_chunks,
            self.chunks_received,
            self.duplicate_chunks,
            self.retry_requests_sent,
            self.retry_requests_received,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratios() {
        let mut stats = TransferStats::new();
        assert_eq!(stats.retransmit_ratio(), 0.0);
        assert_eq!(stats.duplicate_ratio(), 0.0);

        stats.chunks_sent = 30;
        stats.retransmitted_chunks = 10;
        stats.chunks_received = 9;
        stats.duplicate_chunks = 1;
        assert!((stats.retransmit_ratio() - 0.25).abs() < f64::EPSILON);
        assert!((stats.duplicate_ratio() - 0.1).abs() < f64::EPSILON);
        assert!(stats.summary().contains("sent 30 (+10 retx)"));
    }
}
