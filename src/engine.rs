//! 전송 엔진
//!
//! 세션 저장소, 재시도 스케줄러, 저장소 워커를 소유하는 단일 태스크.
//! 패킷 수신, 타이머 만료, 저장소 작업 결과, 외부 명령이 모두 하나의 채널로
//! 들어와 순서대로 처리되므로 세션 상태는 이 태스크에서만 변경됨

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::chunk::{ChunkIndex, TransferId};
use crate::delegate::{TransferDelegate, TransferEvent};
use crate::message::Message;
use crate::scheduler::{RetryScheduler, TimerKey, TimerKind};
use crate::session::{Outcome, SessionSnapshot, SessionStore, TransferRole};
use crate::stats::TransferStats;
use crate::store::ChunkStore;
use crate::transport::Transport;
use crate::worker::{StorageJob, StorageOutcome, StorageWorker};
use crate::{Config, Error, FailureReason, Result, TimeoutCause};

/// 송신 요청
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub file_name: String,
    /// 외부 코덱을 거친 최종 바이트
    pub data: Bytes,
    /// 압축 전 크기 (알 경우)
    pub original_size: Option<u64>,
}

impl SendRequest {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            data: data.into(),
            original_size: None,
        }
    }

    pub fn with_original_size(mut self, original_size: u64) -> Self {
        self.original_size = Some(original_size);
        self
    }
}

/// 타이머 만료 이벤트
#[derive(Debug)]
pub(crate) enum TimerEvent {
    /// 페이싱 간격 후 다음 청크 전송
    SendNext {
        transfer_id: TransferId,
        chunk_index: ChunkIndex,
    },
    /// 청크 재시도 타이머 만료
    ChunkRetry {
        transfer_id: TransferId,
        chunk_index: ChunkIndex,
    },
    /// 지터/스태거 후 재전송
    Retransmit {
        transfer_id: TransferId,
        chunk_index: ChunkIndex,
    },
    /// 수신 데드라인 만료
    Deadline { transfer_id: TransferId },
    /// 진행 모니터 주기
    Monitor { transfer_id: TransferId },
}

/// 엔진 명령
pub(crate) enum EngineCmd {
    Send {
        request: SendRequest,
        reply: oneshot::Sender<Result<TransferId>>,
    },
    Cancel {
        transfer_id: TransferId,
        reply: oneshot::Sender<Result<()>>,
    },
    Packet(Bytes),
    Timer(TimerEvent),
    Session {
        transfer_id: TransferId,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    ActiveTransfers(oneshot::Sender<Vec<SessionSnapshot>>),
    FinishedTransfers(oneshot::Sender<Vec<SessionSnapshot>>),
    Stats(oneshot::Sender<TransferStats>),
    Shutdown,
}

/// 엔진 내부 상태 (엔진 태스크에서만 접근)
///
/// 송신/수신 처리는 `sender`, `receiver` 모듈의 impl 블록에 있음
pub(crate) struct EngineInner {
    pub(crate) config: Config,
    pub(crate) node_id: String,
    pub(crate) sessions: SessionStore,
    pub(crate) scheduler: RetryScheduler<EngineCmd>,
    pub(crate) worker: StorageWorker,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) delegate: Arc<dyn TransferDelegate>,
    pub(crate) events: broadcast::Sender<TransferEvent>,
    pub(crate) stats: TransferStats,
}

impl EngineInner {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCmd>,
        mut storage_rx: mpsc::Receiver<StorageOutcome>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(EngineCmd::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(outcome) = storage_rx.recv() => self.handle_storage(outcome),
            }
        }

        self.scheduler.cancel_all();
        info!("전송 엔진 종료: {}", self.stats.summary());
    }

    fn handle_command(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::Send { request, reply } => {
                let result = self.start_send(request);
                if let Err(e) = &result {
                    warn!("송신 요청 거부: {}", e);
                }
                let _ = reply.send(result);
            }
            EngineCmd::Cancel { transfer_id, reply } => {
                let _ = reply.send(self.cancel_local(&transfer_id));
            }
            EngineCmd::Packet(packet) => self.handle_packet(packet),
            EngineCmd::Timer(event) => self.handle_timer(event),
            EngineCmd::Session { transfer_id, reply } => {
                let snapshot = self.sessions.lookup(&transfer_id);
                let _ = reply.send(snapshot);
            }
            EngineCmd::ActiveTransfers(reply) => {
                let _ = reply.send(self.sessions.active_snapshots());
            }
            EngineCmd::FinishedTransfers(reply) => {
                let _ = reply.send(self.sessions.finished_snapshots());
            }
            EngineCmd::Stats(reply) => {
                let _ = reply.send(self.stats.clone());
            }
            EngineCmd::Shutdown => {}
        }
    }

    fn handle_packet(&mut self, packet: Bytes) {
        let (header, message) = match Message::from_bytes(&packet) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.malformed_packets += 1;
                debug!("패킷 해석 실패 ({} bytes): {}", packet.len(), e);
                return;
            }
        };

        // 전송 계층이 되돌려준 자기 패킷
        if header.sender_id == self.node_id {
            return;
        }

        let from = header.sender_id;
        match message {
            Message::Metadata(metadata) => self.on_metadata(metadata, &from),
            Message::Chunk(chunk) => self.on_chunk(chunk, &from),
            Message::RetryRequest(request) => self.on_retry_request(request, &from),
            Message::Complete(transfer_id) => self.on_remote_complete(&transfer_id, &from),
            Message::Cancel(transfer_id) => self.on_remote_cancel(&transfer_id, &from),
        }
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::SendNext {
                transfer_id,
                chunk_index,
            } => self.on_send_next(&transfer_id, chunk_index),
            TimerEvent::ChunkRetry {
                transfer_id,
                chunk_index,
            } => self.on_chunk_retry_timeout(&transfer_id, chunk_index),
            TimerEvent::Retransmit {
                transfer_id,
                chunk_index,
            } => self.on_retransmit(&transfer_id, chunk_index),
            TimerEvent::Deadline { transfer_id } => self.on_deadline(&transfer_id),
            TimerEvent::Monitor { transfer_id } => self.on_monitor_tick(&transfer_id),
        }
    }

    fn handle_storage(&mut self, outcome: StorageOutcome) {
        match outcome {
            StorageOutcome::PutFailed {
                transfer_id,
                key,
                error,
            } => {
                error!("저장 실패: key={}, {}", key, error);
                if self.sessions.is_active(&transfer_id) {
                    self.fail(&transfer_id, FailureReason::StorageWriteFailure(error));
                }
            }
            StorageOutcome::ChunkLoaded {
                transfer_id,
                chunk_index,
                kind,
                data,
            } => self.on_chunk_loaded(&transfer_id, chunk_index, kind, data),
            StorageOutcome::Assembled {
                transfer_id,
                result,
            } => self.on_assembled(&transfer_id, result),
        }
    }

    /// 메시지를 인코딩해 브로드캐스트. 실패는 로그만 남김
    pub(crate) fn broadcast_message(&self, message: &Message) -> bool {
        let packet = match message.to_bytes(&self.node_id, self.config.hop_limit) {
            Ok(packet) => packet,
            Err(e) => {
                error!(
                    "메시지 인코딩 실패: {:?} transfer={}: {}",
                    message.msg_type(),
                    message.transfer_id(),
                    e
                );
                return false;
            }
        };

        match self.transport.broadcast(Bytes::from(packet)) {
            Ok(()) => true,
            Err(e) => {
                warn!("브로드캐스트 실패: {:?}: {}", message.msg_type(), e);
                false
            }
        }
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        // 구독자가 없으면 에러지만 무시
        let _ = self.events.send(event);
    }

    pub(crate) fn schedule(
        &self,
        transfer_id: &str,
        kind: TimerKind,
        delay: Duration,
        event: TimerEvent,
    ) {
        self.scheduler
            .schedule(TimerKey::new(transfer_id, kind), delay, EngineCmd::Timer(event));
    }

    pub(crate) fn submit(&self, job: StorageJob) -> bool {
        let submitted = self.worker.submit(job);
        if !submitted {
            error!("저장소 워커 종료됨");
        }
        submitted
    }

    /// 세션 종료 처리: 상태 전이, 타이머/저장 항목 해제, 통계, 이벤트
    ///
    /// 이미 종료된 세션이면 None
    pub(crate) fn finish(
        &mut self,
        transfer_id: &str,
        outcome: Outcome,
        path: Option<PathBuf>,
    ) -> Option<SessionSnapshot> {
        let snapshot = self.sessions.finish(transfer_id, outcome.clone())?;
        self.release(transfer_id);

        let event = match outcome {
            Outcome::Completed => {
                self.stats.completed_transfers += 1;
                info!(
                    "전송 완료: {} ({}, {} bytes, {:.2}s)",
                    transfer_id,
                    snapshot.file_name,
                    snapshot.total_size,
                    snapshot.elapsed.as_secs_f64()
                );
                TransferEvent::Completed {
                    transfer_id: transfer_id.to_string(),
                    path,
                }
            }
            Outcome::Failed(reason) => {
                self.stats.failed_transfers += 1;
                warn!("전송 실패: {}: {}", transfer_id, reason);
                TransferEvent::Failed {
                    transfer_id: transfer_id.to_string(),
                    reason,
                }
            }
            Outcome::Cancelled(reason) => {
                self.stats.cancelled_transfers += 1;
                info!("전송 취소: {}: {}", transfer_id, reason);
                TransferEvent::Cancelled {
                    transfer_id: transfer_id.to_string(),
                    reason,
                }
            }
        };
        self.emit(event);

        Some(snapshot)
    }

    pub(crate) fn fail(&mut self, transfer_id: &str, reason: FailureReason) {
        self.finish(transfer_id, Outcome::Failed(reason), None);
    }

    /// 전송에 걸린 타이머와 저장 항목 해제
    fn release(&mut self, transfer_id: &str) {
        self.scheduler.cancel_transfer(transfer_id);
        self.submit(StorageJob::DeleteTransfer {
            transfer_id: transfer_id.to_string(),
        });
    }

    fn cancel_local(&mut self, transfer_id: &str) -> Result<()> {
        if self
            .finish(transfer_id, Outcome::Cancelled(FailureReason::UserCancelled), None)
            .is_none()
        {
            return Err(Error::UnknownTransfer(transfer_id.to_string()));
        }
        self.broadcast_message(&Message::Cancel(transfer_id.to_string()));
        Ok(())
    }

    /// 수신측이 보낸 완료 알림. 이 노드가 보낸 전송에만 적용
    fn on_remote_complete(&mut self, transfer_id: &str, from: &str) {
        match self.sessions.get(transfer_id) {
            Some(session) if session.role() == TransferRole::Outgoing => {}
            Some(_) => {
                debug!("수신 중인 전송의 타 노드 완료 알림 무시: {} from {}", transfer_id, from);
                return;
            }
            None => return,
        }

        info!("원격 완료 알림: {} from {}", transfer_id, from);
        if self.finish(transfer_id, Outcome::Completed, None).is_some() {
            self.delegate.on_transfer_complete(transfer_id, from);
        }
    }

    /// 송신자가 보낸 취소 알림. 원 송신자가 보낸 경우에만 적용
    fn on_remote_cancel(&mut self, transfer_id: &str, from: &str) {
        match self.sessions.get(transfer_id) {
            Some(session)
                if session.role() == TransferRole::Incoming
                    && session.metadata().sender_id == from => {}
            Some(_) => {
                warn!("송신자가 아닌 노드의 취소 알림 무시: {} from {}", transfer_id, from);
                return;
            }
            None => return,
        }

        if self
            .finish(
                transfer_id,
                Outcome::Cancelled(FailureReason::CancelledBySender),
                None,
            )
            .is_some()
        {
            self.delegate.on_transfer_cancelled(transfer_id, from);
        }
    }

    fn on_deadline(&mut self, transfer_id: &str) {
        let Some(session) = self.sessions.get(transfer_id) else {
            return;
        };
        if session.is_assembling() {
            return;
        }
        warn!(
            "전송 데드라인 초과: {} ({}/{} 청크)",
            transfer_id,
            session.received_count(),
            session.metadata().total_chunks
        );
        self.fail(
            transfer_id,
            FailureReason::TransferTimeout(TimeoutCause::Deadline),
        );
    }

    fn on_monitor_tick(&mut self, transfer_id: &str) {
        if !self.sessions.is_active(transfer_id) {
            self.scheduler
                .cancel(&TimerKey::new(transfer_id, TimerKind::Monitor));
            return;
        }
        self.apply_policy(transfer_id, tokio::time::Instant::now());
    }
}

/// 전송 엔진 핸들
///
/// 복제해서 여러 태스크(수신 루프, CLI 등)에서 함께 사용 가능
#[derive(Clone)]
pub struct TransferEngine {
    cmd_tx: mpsc::Sender<EngineCmd>,
    events: broadcast::Sender<TransferEvent>,
    node_id: Arc<str>,
}

impl TransferEngine {
    /// 엔진 태스크 시작 (tokio 런타임 안에서 호출)
    pub fn start(
        config: Config,
        node_id: impl Into<String>,
        store: Arc<dyn ChunkStore>,
        transport: Arc<dyn Transport>,
        delegate: Arc<dyn TransferDelegate>,
    ) -> Result<Self> {
        config.validate()?;
        let node_id = node_id.into();
        if node_id.is_empty() {
            return Err(Error::InvalidConfig("node_id는 비어 있을 수 없음".into()));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCmd>(config.command_buffer_size);
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));
        let (worker, storage_rx) = StorageWorker::spawn(store, config.command_buffer_size);

        info!(
            "전송 엔진 시작: node={}, chunk_size={}, interval={}ms",
            node_id, config.chunk_size, config.chunk_interval_ms
        );

        let sessions = SessionStore::with_history(config.finished_history_size);
        let inner = EngineInner {
            scheduler: RetryScheduler::new(cmd_tx.clone()),
            config,
            node_id: node_id.clone(),
            sessions,
            worker,
            transport,
            delegate,
            events: events.clone(),
            stats: TransferStats::new(),
        };
        tokio::spawn(inner.run(cmd_rx, storage_rx));

        Ok(Self {
            cmd_tx,
            events,
            node_id: node_id.into(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> EngineCmd) -> Result<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::EngineStopped)?;
        reply_rx.await.map_err(|_| Error::EngineStopped)
    }

    /// 새 송신 전송 시작, 전송 ID 반환
    pub async fn send(&self, request: SendRequest) -> Result<TransferId> {
        self.request(|reply| EngineCmd::Send { request, reply })
            .await?
    }

    /// 로컬 취소 (송신/수신 모두)
    pub async fn cancel(&self, transfer_id: &str) -> Result<()> {
        let transfer_id = transfer_id.to_string();
        self.request(|reply| EngineCmd::Cancel { transfer_id, reply })
            .await?
    }

    /// 전송 계층에서 받은 패킷 전달
    pub async fn handle_packet(&self, packet: Bytes) -> Result<()> {
        self.cmd_tx
            .send(EngineCmd::Packet(packet))
            .await
            .map_err(|_| Error::EngineStopped)
    }

    /// 활성 또는 종료된 세션 조회
    pub async fn session(&self, transfer_id: &str) -> Result<Option<SessionSnapshot>> {
        let transfer_id = transfer_id.to_string();
        self.request(|reply| EngineCmd::Session { transfer_id, reply })
            .await
    }

    pub async fn active_transfers(&self) -> Result<Vec<SessionSnapshot>> {
        self.request(EngineCmd::ActiveTransfers).await
    }

    pub async fn finished_transfers(&self) -> Result<Vec<SessionSnapshot>> {
        self.request(EngineCmd::FinishedTransfers).await
    }

    pub async fn stats(&self) -> Result<TransferStats> {
        self.request(EngineCmd::Stats).await
    }

    /// 관찰자 이벤트 구독
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// 엔진 정지. 예약된 타이머는 모두 취소됨
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(EngineCmd::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use parking_lot::Mutex;

    use super::*;
    use crate::chunk::{Chunk, ChunkSplitter, TransferMetadata};
    use crate::message::RetryRequest;
    use crate::session::TransferStatus;
    use crate::store::{chunk_key, MemoryChunkStore};
    use crate::DEFAULT_HOP_LIMIT;

    /// 보낸 패킷을 기록하고 연결된 상대 엔진으로 넘기는 테스트용 링크
    #[derive(Default)]
    struct LinkTransport {
        sent: Mutex<Vec<Bytes>>,
        peer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
        /// 최초 한 번만 유실시킬 청크 인덱스
        drop_once: Mutex<HashSet<ChunkIndex>>,
    }

    impl LinkTransport {
        fn messages(&self) -> Vec<Message> {
            self.sent
                .lock()
                .iter()
                .map(|packet| Message::from_bytes(packet).unwrap().1)
                .collect()
        }

        fn chunk_sends(&self) -> Vec<ChunkIndex> {
            self.messages()
                .into_iter()
                .filter_map(|message| match message {
                    Message::Chunk(chunk) => Some(chunk.index),
                    _ => None,
                })
                .collect()
        }

        fn retry_requests(&self) -> Vec<RetryRequest> {
            self.messages()
                .into_iter()
                .filter_map(|message| match message {
                    Message::RetryRequest(request) => Some(request),
                    _ => None,
                })
                .collect()
        }
    }

    impl Transport for LinkTransport {
        fn broadcast(&self, packet: Bytes) -> Result<()> {
            self.sent.lock().push(packet.clone());
            if let Ok((_, Message::Chunk(chunk))) = Message::from_bytes(&packet) {
                if self.drop_once.lock().remove(&chunk.index) {
                    return Ok(());
                }
            }
            if let Some(peer) = self.peer.lock().as_ref() {
                let _ = peer.send(packet);
            }
            Ok(())
        }
    }

    struct RecordingDelegate {
        dir: PathBuf,
        completed: Mutex<Vec<(String, String)>>,
        cancelled: Mutex<Vec<(String, String)>>,
    }

    impl TransferDelegate for RecordingDelegate {
        fn resolve_storage_path(&self, transfer_id: &str, file_name: &str) -> PathBuf {
            self.dir.join(format!("{}-{}", transfer_id, file_name))
        }

        fn on_transfer_complete(&self, transfer_id: &str, sender_id: &str) {
            self.completed
                .lock()
                .push((transfer_id.to_string(), sender_id.to_string()));
        }

        fn on_transfer_cancelled(&self, transfer_id: &str, peer_id: &str) {
            self.cancelled
                .lock()
                .push((transfer_id.to_string(), peer_id.to_string()));
        }
    }

    /// 키별로 저장 실패/손상을 주입할 수 있는 메모리 저장소
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryChunkStore,
        /// 저장할 때 첫 바이트를 뒤집는 키
        corrupt: Mutex<HashSet<String>>,
        /// 저장이 실패하는 키
        reject: Mutex<HashSet<String>>,
        /// 설정되면 다음 조회는 신호를 받을 때까지 멈춤
        hold_get: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    }

    impl FlakyStore {
        fn is_empty(&self) -> bool {
            self.inner.is_empty()
        }
    }

    impl ChunkStore for FlakyStore {
        fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
            if self.reject.lock().contains(key) {
                return Err(Error::Storage(format!("공간 부족: {}", key)));
            }
            if self.corrupt.lock().contains(key) {
                let mut bytes = bytes.to_vec();
                bytes[0] ^= 0xFF;
                return self.inner.put(key, &bytes);
            }
            self.inner.put(key, bytes)
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let hold = self.hold_get.lock().take();
            if let Some(release) = hold {
                let _ = release.recv();
            }
            self.inner.get(key)
        }

        fn delete_prefix(&self, prefix: &str) -> Result<usize> {
            self.inner.delete_prefix(prefix)
        }
    }

    struct Node {
        engine: TransferEngine,
        transport: Arc<LinkTransport>,
        delegate: Arc<RecordingDelegate>,
        store: Arc<FlakyStore>,
        _dir: tempfile::TempDir,
    }

    fn node(node_id: &str) -> Node {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(LinkTransport::default());
        let store = Arc::new(FlakyStore::default());
        let delegate = Arc::new(RecordingDelegate {
            dir: dir.path().to_path_buf(),
            completed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        });
        let engine = TransferEngine::start(
            Config::default(),
            node_id,
            store.clone(),
            transport.clone(),
            delegate.clone(),
        )
        .unwrap();

        Node {
            engine,
            transport,
            delegate,
            store,
            _dir: dir,
        }
    }

    /// `from`이 보내는 패킷을 `to` 엔진으로 전달
    fn connect(from: &Node, to: &Node) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        *from.transport.peer.lock() = Some(tx);
        let engine = to.engine.clone();
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if engine.handle_packet(packet).await.is_err() {
                    break;
                }
            }
        });
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn packet(sender_id: &str, message: Message) -> Bytes {
        Bytes::from(message.to_bytes(sender_id, DEFAULT_HOP_LIMIT).unwrap())
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<TransferEvent>, mut pred: F) -> TransferEvent
    where
        F: FnMut(&TransferEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("이벤트 채널 닫힘"),
                }
            }
        })
        .await
        .expect("이벤트 대기 시간 초과")
    }

    async fn status(node: &Node, transfer_id: &str) -> TransferStatus {
        node.engine
            .session(transfer_id)
            .await
            .unwrap()
            .expect("세션 없음")
            .status
    }

    /// 원격 송신자 "node-a"가 보낸 것처럼 메타데이터를 주입
    async fn inject_metadata(node: &Node, transfer_id: &str, data: &[u8]) -> TransferMetadata {
        let metadata =
            TransferMetadata::new(transfer_id.into(), "remote.jpg", "node-a", data, 256, None)
                .unwrap();
        node.engine
            .handle_packet(packet("node-a", Message::Metadata(metadata.clone())))
            .await
            .unwrap();
        metadata
    }

    async fn inject_chunks(node: &Node, transfer_id: &str, data: &[u8], indices: impl Iterator<Item = u32>) {
        let chunks = ChunkSplitter::new(256).split(transfer_id, data);
        for index in indices {
            let chunk = chunks[index as usize].clone();
            node.engine
                .handle_packet(packet("node-a", Message::Chunk(chunk)))
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_transfer() {
        let a = node("node-a");
        let b = node("node-b");
        connect(&a, &b);
        connect(&b, &a);
        let mut a_events = a.engine.subscribe();
        let mut b_events = b.engine.subscribe();

        let data = sample(1000);
        let id = a
            .engine
            .send(SendRequest::new("photo.webp", data.clone()))
            .await
            .unwrap();
        assert_eq!(id.len(), 32);

        let path = match wait_for(&mut b_events, TransferEvent::is_terminal).await {
            TransferEvent::Completed {
                transfer_id,
                path: Some(path),
            } => {
                assert_eq!(transfer_id, id);
                path
            }
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(std::fs::read(&path).unwrap(), data);

        let event = wait_for(&mut a_events, TransferEvent::is_terminal).await;
        assert!(matches!(event, TransferEvent::Completed { path: None, .. }));

        let snapshot = b.engine.session(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, TransferStatus::Completed);
        assert_eq!(snapshot.received_chunks, 4);
        assert_eq!(snapshot.progress, 1.0);
        assert_eq!(snapshot.sender_id, "node-a");
        assert_eq!(status(&a, &id).await, TransferStatus::Completed);

        assert_eq!(
            *b.delegate.completed.lock(),
            vec![(id.clone(), "node-a".to_string())]
        );
        assert_eq!(
            *a.delegate.completed.lock(),
            vec![(id.clone(), "node-b".to_string())]
        );

        // 완료 후 늦게 도착한 청크는 무시
        let late = Chunk::new(id.clone(), 0, Bytes::from(data[..256].to_vec()), false);
        b.engine
            .handle_packet(packet("node-a", Message::Chunk(late)))
            .await
            .unwrap();
        let stats = b.engine.stats().await.unwrap();
        assert_eq!(stats.completed_transfers, 1);
        assert_eq!(stats.chunks_received, 4);
        assert!(b.engine.active_transfers().await.unwrap().is_empty());
        assert_eq!(b.engine.finished_transfers().await.unwrap().len(), 1);

        let a_stats = a.engine.stats().await.unwrap();
        assert_eq!(a_stats.chunks_sent, 4);
        assert_eq!(a_stats.retransmitted_chunks, 0);

        // 종료된 전송의 저장 항목 정리
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(a.store.is_empty());
        assert!(b.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_chunk_recovered_by_retry_request() {
        let a = node("node-a");
        let b = node("node-b");
        connect(&a, &b);
        connect(&b, &a);
        a.transport.drop_once.lock().insert(2);
        let mut b_events = b.engine.subscribe();

        let data = sample(1000);
        let id = a
            .engine
            .send(SendRequest::new("photo.webp", data.clone()))
            .await
            .unwrap();

        let event = wait_for(&mut b_events, TransferEvent::is_terminal).await;
        assert!(matches!(event, TransferEvent::Completed { .. }));

        let requests = b.transport.retry_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].transfer_id, id);
        assert_eq!(requests[0].missing_chunk_ids, vec![2]);

        let a_stats = a.engine.stats().await.unwrap();
        assert_eq!(a_stats.retry_requests_received, 1);
        assert_eq!(a_stats.retransmitted_chunks, 1);
        assert_eq!(a.transport.chunk_sends(), vec![0, 1, 2, 3, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphan_chunk_and_own_echo_are_dropped() {
        let a = node("node-a");

        let chunk = Chunk::new("unknown".into(), 0, Bytes::from_static(b"abc"), true);
        a.engine
            .handle_packet(packet("node-b", Message::Chunk(chunk)))
            .await
            .unwrap();

        // 자기 ID로 보낸 메타데이터는 무시
        let metadata =
            TransferMetadata::new("echo".into(), "x.jpg", "node-a", b"abc", 256, None).unwrap();
        a.engine
            .handle_packet(packet("node-a", Message::Metadata(metadata)))
            .await
            .unwrap();

        a.engine
            .handle_packet(Bytes::from_static(b"garbage"))
            .await
            .unwrap();

        assert!(a.engine.session("unknown").await.unwrap().is_none());
        assert!(a.engine.session("echo").await.unwrap().is_none());
        let stats = a.engine.stats().await.unwrap();
        assert_eq!(stats.orphan_chunks, 1);
        assert_eq!(stats.malformed_packets, 1);
        assert_eq!(stats.incoming_transfers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_invalid_chunks_do_not_mutate_session() {
        let b = node("node-b");
        let data = sample(1000);
        inject_metadata(&b, "dup", &data).await;
        assert_eq!(status(&b, "dup").await, TransferStatus::Waiting);

        inject_chunks(&b, "dup", &data, [0, 0].into_iter()).await;

        let out_of_range = Chunk::new("dup".into(), 10, Bytes::from(vec![1u8; 256]), false);
        let short = Chunk::new("dup".into(), 1, Bytes::from(vec![1u8; 100]), false);
        for chunk in [out_of_range, short] {
            b.engine
                .handle_packet(packet("node-a", Message::Chunk(chunk)))
                .await
                .unwrap();
        }

        let snapshot = b.engine.session("dup").await.unwrap().unwrap();
        assert_eq!(snapshot.status, TransferStatus::InProgress);
        assert_eq!(snapshot.received_chunks, 1);
        assert_eq!(snapshot.progress, 0.25);

        let stats = b.engine.stats().await.unwrap();
        assert_eq!(stats.chunks_received, 1);
        assert_eq!(stats.duplicate_chunks, 1);
        assert_eq!(stats.rejected_chunks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_without_chunks_hits_deadline() {
        let b = node("node-b");
        inject_metadata(&b, "quiet", &sample(1000)).await;

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(status(&b, "quiet").await, TransferStatus::Waiting);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let snapshot = b.engine.session("quiet").await.unwrap().unwrap();
        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert_eq!(
            snapshot.error,
            Some(FailureReason::TransferTimeout(TimeoutCause::Deadline))
        );
        assert!(b.transport.retry_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_missing_chunks_fails() {
        let b = node("node-b");
        let data = sample(50 * 256);
        inject_metadata(&b, "lossy", &data).await;
        inject_chunks(&b, "lossy", &data, 0..38).await;

        tokio::time::sleep(Duration::from_secs(41)).await;

        let snapshot = b.engine.session("lossy").await.unwrap().unwrap();
        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert_eq!(
            snapshot.error,
            Some(FailureReason::TooManyMissingChunks { missing: 12 })
        );

        let requests = b.transport.retry_requests();
        assert!(!requests.is_empty());
        for request in &requests {
            assert_eq!(request.missing_chunk_ids, (38..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_sending() {
        let a = node("node-a");
        let id = a
            .engine
            .send(SendRequest::new("big.jpg", sample(20 * 256)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        a.engine.cancel(&id).await.unwrap();
        let sent = a.transport.chunk_sends().len();
        assert!((2..20).contains(&sent));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(a.transport.chunk_sends().len(), sent);
        assert_eq!(a.transport.messages().last(), Some(&Message::Cancel(id.clone())));

        let snapshot = a.engine.session(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, TransferStatus::Cancelled);
        assert_eq!(snapshot.error, Some(FailureReason::UserCancelled));
        assert!(matches!(
            a.engine.cancel(&id).await,
            Err(Error::UnknownTransfer(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_cancel_reaches_receiver() {
        let a = node("node-a");
        let b = node("node-b");
        connect(&a, &b);
        connect(&b, &a);
        let mut b_events = b.engine.subscribe();

        let id = a
            .engine
            .send(SendRequest::new("big.jpg", sample(20 * 256)))
            .await
            .unwrap();
        wait_for(&mut b_events, |e| matches!(e, TransferEvent::Progress { .. })).await;

        // 송신자가 아닌 노드의 취소는 무시
        b.engine
            .handle_packet(packet("node-c", Message::Cancel(id.clone())))
            .await
            .unwrap();
        assert_eq!(status(&b, &id).await, TransferStatus::InProgress);

        a.engine.cancel(&id).await.unwrap();
        let event = wait_for(&mut b_events, TransferEvent::is_terminal).await;
        assert_eq!(
            event,
            TransferEvent::Cancelled {
                transfer_id: id.clone(),
                reason: FailureReason::CancelledBySender,
            }
        );
        assert_eq!(
            *b.delegate.cancelled.lock(),
            vec![(id.clone(), "node-a".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_chunk_exhausts_retries() {
        let a = node("node-a");
        let id = a
            .engine
            .send(SendRequest::new("tiny.jpg", sample(200)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(status(&a, &id).await, TransferStatus::InProgress);

        tokio::time::sleep(Duration::from_secs(25)).await;
        let snapshot = a.engine.session(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert_eq!(
            snapshot.error,
            Some(FailureReason::RetryExhausted { chunk_index: 0 })
        );
        // 최초 1회 + 재시도 3회
        assert_eq!(a.transport.chunk_sends(), vec![0, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_request_is_staggered_and_bounded() {
        let a = node("node-a");
        let id = a
            .engine
            .send(SendRequest::new("photo.webp", sample(1000)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(a.transport.chunk_sends(), vec![0, 1, 2, 3]);

        let request = RetryRequest::new(id.clone(), vec![3, 99, 1]);
        a.engine
            .handle_packet(packet("node-b", Message::RetryRequest(request)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.transport.chunk_sends(), vec![0, 1, 2, 3, 3]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.transport.chunk_sends(), vec![0, 1, 2, 3, 3, 1]);

        let stats = a.engine.stats().await.unwrap();
        assert_eq!(stats.retry_requests_received, 1);
        assert_eq!(stats.retransmitted_chunks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_metadata_is_rejected() {
        let b = node("node-b");

        let mut huge =
            TransferMetadata::new("huge".into(), "remote.jpg", "node-a", &sample(256), 256, None)
                .unwrap();
        huge.total_size = u64::MAX;
        // ceil(L / C)를 u32로 자르면 1이 되는 크기
        let mut truncated = huge.clone();
        truncated.transfer_id = "trunc".into();
        truncated.total_size = (1u64 << 40) + 1;
        // 설정과 다른 청크 크기
        let foreign =
            TransferMetadata::new("foreign".into(), "remote.jpg", "node-a", &sample(1000), 128, None)
                .unwrap();

        for metadata in [huge, truncated, foreign] {
            b.engine
                .handle_packet(packet("node-a", Message::Metadata(metadata)))
                .await
                .unwrap();
        }
        let chunk = Chunk::new("trunc".into(), 0, Bytes::from(vec![1u8; 256]), true);
        b.engine
            .handle_packet(packet("node-a", Message::Chunk(chunk)))
            .await
            .unwrap();

        // 엔진 태스크는 계속 동작하고 세션은 만들어지지 않음
        let stats = b.engine.stats().await.unwrap();
        assert_eq!(stats.incoming_transfers, 0);
        assert_eq!(stats.orphan_chunks, 1);
        for id in ["huge", "trunc", "foreign"] {
            assert!(b.engine.session(id).await.unwrap().is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_chunk_fails_assembly() {
        let b = node("node-b");
        let mut events = b.engine.subscribe();
        let data = sample(1000);
        b.store.corrupt.lock().insert(chunk_key("bad", 1));

        inject_metadata(&b, "bad", &data).await;
        inject_chunks(&b, "bad", &data, 0..4).await;

        let event = wait_for(&mut events, TransferEvent::is_terminal).await;
        assert_eq!(
            event,
            TransferEvent::Failed {
                transfer_id: "bad".into(),
                reason: FailureReason::ChecksumMismatch,
            }
        );

        let snapshot = b.engine.session("bad").await.unwrap().unwrap();
        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert_eq!(snapshot.error, Some(FailureReason::ChecksumMismatch));
        assert!(!b
            .transport
            .messages()
            .iter()
            .any(|message| matches!(message, Message::Complete(_))));
        assert!(b.delegate.completed.lock().is_empty());
        assert!(!b.delegate.resolve_storage_path("bad", "remote.jpg").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_write_failure_fails_transfer() {
        let b = node("node-b");
        let mut events = b.engine.subscribe();
        let data = sample(1000);
        b.store.reject.lock().insert(chunk_key("full", 1));

        inject_metadata(&b, "full", &data).await;
        inject_chunks(&b, "full", &data, 0..2).await;

        let event = wait_for(&mut events, TransferEvent::is_terminal).await;
        assert!(matches!(
            event,
            TransferEvent::Failed {
                reason: FailureReason::StorageWriteFailure(_),
                ..
            }
        ));

        // 실패 이후 도착한 청크로 세션이 되살아나지 않음
        inject_chunks(&b, "full", &data, 2..4).await;
        let snapshot = b.engine.session("full").await.unwrap().unwrap();
        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert!(matches!(
            snapshot.error,
            Some(FailureReason::StorageWriteFailure(_))
        ));
        assert_eq!(b.engine.stats().await.unwrap().chunks_received, 2);
        assert!(b.delegate.completed.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_assembly_discards_late_result() {
        let b = node("node-b");
        let data = sample(1000);
        let (release, hold) = std::sync::mpsc::channel();
        *b.store.hold_get.lock() = Some(hold);

        inject_metadata(&b, "late", &data).await;
        inject_chunks(&b, "late", &data, 0..4).await;

        // 조립이 저장소 조회에서 멈춘 사이 취소
        b.engine.cancel("late").await.unwrap();
        release.send(()).unwrap();

        // 조립이 끝나면 청크가 지워지고, 늦게 쓰인 결과 파일도 삭제되어야 함
        let path = b.delegate.resolve_storage_path("late", "remote.jpg");
        let mut discarded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if b.store.is_empty() && !path.exists() {
                discarded = true;
                break;
            }
        }
        assert!(discarded, "조립 결과가 남아 있음: {}", path.display());

        let snapshot = b.engine.session("late").await.unwrap().unwrap();
        assert_eq!(snapshot.status, TransferStatus::Cancelled);
        assert_eq!(snapshot.error, Some(FailureReason::UserCancelled));
        assert!(b.delegate.completed.lock().is_empty());
        assert!(!b
            .transport
            .messages()
            .iter()
            .any(|message| matches!(message, Message::Complete(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        let result = TransferEngine::start(
            config,
            "node-a",
            Arc::new(MemoryChunkStore::new()),
            Arc::new(LinkTransport::default()),
            Arc::new(crate::delegate::FsDelegate::new(dir.path())),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_send_rejects_empty_payload() {
        let a = node("node-a");
        let result = a.engine.send(SendRequest::new("empty.jpg", Vec::new())).await;
        assert!(matches!(result, Err(Error::EmptyPayload)));

        a.engine.shutdown().await;
        assert!(matches!(
            a.engine.stats().await,
            Err(Error::EngineStopped)
        ));
    }
}
