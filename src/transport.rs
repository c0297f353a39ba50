//! 브로드캐스트 전송 계층 경계
//!
//! 코어는 `broadcast(packet)`만 호출함. 전달 보장/순서/ACK 없음

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::engine::TransferEngine;
use crate::{Error, Result};

/// 브로드캐스트 전송 인터페이스
///
/// 엔진 태스크에서 호출되므로 블로킹하면 안 됨
pub trait Transport: Send + Sync {
    /// 최선 노력 브로드캐스트
    fn broadcast(&self, packet: Bytes) -> Result<()>;
}

/// UDP 브로드캐스트 전송
///
/// 메시 라디오 대신 LAN 브로드캐스트로 동일한 약한 전달 계약을 흉내냄
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl UdpTransport {
    /// 소켓 바인딩
    pub async fn bind(bind_addr: SocketAddr, target: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;

        info!("UDP 전송 시작: bind={}, target={}", bind_addr, target);

        Ok(Self {
            socket: Arc::new(socket),
            target,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 수신 루프: 들어온 데이터그램을 엔진에 전달
    ///
    /// 엔진이 종료되면 반환됨
    pub async fn run_receiver(&self, engine: TransferEngine) -> Result<()> {
        let mut buf = vec![0u8; 65535];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    debug!("패킷 수신: {} bytes from {}", len, addr);
                    match engine.handle_packet(Bytes::copy_from_slice(&buf[..len])).await {
                        Ok(()) => {}
                        Err(Error::EngineStopped) => return Ok(()),
                        Err(e) => warn!("패킷 전달 실패: {}", e),
                    }
                }
                Err(e) => {
                    warn!("수신 에러: {}", e);
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn broadcast(&self, packet: Bytes) -> Result<()> {
        self.socket.try_send_to(&packet, self.target)?;
        Ok(())
    }
}
