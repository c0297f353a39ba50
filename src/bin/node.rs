//! MPT 노드 - Mesh Photo Transfer
//!
//! UDP 브로드캐스트를 메시 링크 대신 사용하는 데모 노드
//! - 파일을 지정하면 전송 후 완료/실패까지 대기
//! - 지정하지 않으면 수신 전용으로 동작 (Ctrl-C로 종료)
//!
//! 사용법:
//!   cargo run --release --bin mpt-node -- [OPTIONS]
//!
//! 예시:
//!   # 수신 노드
//!   cargo run --release --bin mpt-node -- --bind 0.0.0.0:47000 --out ./received
//!
//!   # 송신 노드
//!   cargo run --release --bin mpt-node -- --bind 0.0.0.0:47001 --send photo.webp

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use mpt::{
    Config, FileChunkStore, FsDelegate, SendRequest, TransferEngine, TransferEvent, UdpTransport,
};

type BoxError = Box<dyn std::error::Error>;

/// 노드 설정
struct NodeArgs {
    bind_addr: SocketAddr,
    target_addr: SocketAddr,
    node_id: String,
    send_file: Option<PathBuf>,
    output_dir: PathBuf,
    store_dir: PathBuf,
    config: Config,
}

impl Default for NodeArgs {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 47000)),
            target_addr: SocketAddr::from(([255, 255, 255, 255], 47000)),
            node_id: format!("node-{:08x}", rand::random::<u32>()),
            send_file: None,
            output_dir: PathBuf::from("received"),
            store_dir: PathBuf::from(".mpt-store"),
            config: Config::default(),
        }
    }
}

fn value<T>(args: &[String], i: usize, name: &str) -> Result<T, BoxError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = args
        .get(i + 1)
        .ok_or_else(|| format!("{} 값이 필요함", name))?;
    raw.parse::<T>()
        .map_err(|e| format!("{} 값이 올바르지 않음 ({}): {}", name, raw, e).into())
}

fn print_help() {
    println!(
        r#"MPT Node - Mesh Photo Transfer 노드

손실 많은 브로드캐스트 링크용 청크 전송 데모
- 256바이트 청크 + 고정 간격 페이싱
- NACK 기반 재전송 + SHA-256 검증

사용법:
  cargo run --release --bin mpt-node -- [OPTIONS]

옵션:
  -b, --bind <ADDR>        바인드 주소 (기본: 0.0.0.0:47000)
  -t, --target <ADDR>      브로드캐스트 대상 (기본: 255.255.255.255:47000)
  -n, --node-id <ID>       노드 ID (기본: 임의 생성)
  -s, --send <PATH>        전송할 파일
  -o, --out <DIR>          수신 파일 저장 디렉터리 (기본: ./received)
  --store <DIR>            청크 저장소 디렉터리 (기본: ./.mpt-store)
  --preset <NAME>          long-range | low-latency
  --chunk-size <SIZE>      청크 크기 바이트 (기본: 256)
  --interval <MS>          청크 전송 간격 (기본: 100)
  -h, --help               이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조정 (기본: info)
"#
    );
}

fn parse_args() -> Result<NodeArgs, BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let mut node = NodeArgs::default();

    // 프리셋을 먼저 적용해야 개별 옵션이 덮어씀
    if let Some(pos) = args.iter().position(|a| a == "--preset") {
        node.config = match value::<String>(&args, pos, "--preset")?.as_str() {
            "long-range" => Config::long_range(),
            "low-latency" => Config::low_latency(),
            other => return Err(format!("알 수 없는 프리셋: {}", other).into()),
        };
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                node.bind_addr = value(&args, i, "--bind")?;
                i += 1;
            }
            "--target" | "-t" => {
                node.target_addr = value(&args, i, "--target")?;
                i += 1;
            }
            "--node-id" | "-n" => {
                node.node_id = value(&args, i, "--node-id")?;
                i += 1;
            }
            "--send" | "-s" => {
                node.send_file = Some(value(&args, i, "--send")?);
                i += 1;
            }
            "--out" | "-o" => {
                node.output_dir = value(&args, i, "--out")?;
                i += 1;
            }
            "--store" => {
                node.store_dir = value(&args, i, "--store")?;
                i += 1;
            }
            "--preset" => {
                i += 1;
            }
            "--chunk-size" => {
                node.config.chunk_size = value(&args, i, "--chunk-size")?;
                i += 1;
            }
            "--interval" => {
                node.config.chunk_interval_ms = value(&args, i, "--interval")?;
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    Ok(node)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;

    info!("MPT Node starting...");
    info!("Node ID: {}", args.node_id);
    info!("Bind: {}, target: {}", args.bind_addr, args.target_addr);
    info!(
        "Chunk size: {} bytes, interval: {}ms",
        args.config.chunk_size, args.config.chunk_interval_ms
    );

    let transport = Arc::new(UdpTransport::bind(args.bind_addr, args.target_addr).await?);
    let store = Arc::new(FileChunkStore::open(&args.store_dir)?);
    let delegate = Arc::new(FsDelegate::new(&args.output_dir));

    let engine = TransferEngine::start(
        args.config.clone(),
        args.node_id.clone(),
        store,
        transport.clone(),
        delegate,
    )?;
    let mut events = engine.subscribe();

    // 수신 루프
    let recv_engine = engine.clone();
    let recv_transport = transport.clone();
    tokio::spawn(async move {
        if let Err(e) = recv_transport.run_receiver(recv_engine).await {
            error!("수신 루프 종료: {}", e);
        }
    });

    let outgoing = match &args.send_file {
        Some(path) => {
            let data = tokio::fs::read(path).await?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string());
            info!("Sending {:?} ({} bytes)", path, data.len());
            Some(engine.send(SendRequest::new(file_name, data)).await?)
        }
        None => {
            info!("수신 대기 중 (Ctrl-C로 종료)");
            None
        }
    };

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    report(&event);
                    if event.is_terminal() && outgoing.as_deref() == Some(event.transfer_id()) {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("이벤트 {}개 누락", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("종료 신호 수신");
                break;
            }
        }
    }

    if let Ok(stats) = engine.stats().await {
        info!("{}", stats.summary());
    }
    engine.shutdown().await;

    Ok(())
}

fn report(event: &TransferEvent) {
    match event {
        TransferEvent::Started {
            transfer_id,
            role,
            file_name,
            total_chunks,
        } => info!(
            "[{}] 시작 {:?}: {} ({} 청크)",
            transfer_id, role, file_name, total_chunks
        ),
        TransferEvent::Progress {
            transfer_id,
            received,
            total,
        } => {
            if received == total || received % 10 == 0 {
                info!("[{}] 수신 {}/{}", transfer_id, received, total);
            }
        }
        TransferEvent::RetryRequested {
            transfer_id,
            missing,
        } => info!("[{}] 재전송 요청 {}개", transfer_id, missing.len()),
        TransferEvent::Completed { transfer_id, path } => match path {
            Some(path) => info!("[{}] 완료 -> {}", transfer_id, path.display()),
            None => info!("[{}] 수신측 완료 확인", transfer_id),
        },
        TransferEvent::Failed {
            transfer_id,
            reason,
        } => error!("[{}] 실패: {}", transfer_id, reason),
        TransferEvent::Cancelled {
            transfer_id,
            reason,
        } => warn!("[{}] 취소: {}", transfer_id, reason),
        TransferEvent::ChunkSent { .. } => {}
    }
}
