/// NAT 中继会话
///
/// 入站连接 → 恢复原始目标 → 建立 TLS 隧道 → 双向转发 → 有界关闭。
/// 每个方向各有一个 `ReadDemand` 和一个 `WriteCoalescer`，读端只有在上一块
/// 数据被对端传输层接受后才会再次读取。
use crate::config::RelayConfig;
use crate::connector::{ConnectionContext, OutboundConnector};
use crate::error::Result;
use crate::logging::{log_with_endpoint, Severity};
use crate::read_demand::ReadDemand;
use crate::shutdown::spawn_shutdown;
use crate::tproxy;
use crate::write_coalescer::{SharedWriter, WriteCoalescer};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 单次读取的缓冲区大小
const READ_BUFFER_SIZE: usize = 8192;

/// 生成隧道建立后首先发送的请求头
///
/// 请求帧格式由上层协议决定，这里只负责把它放在所有转发数据之前。
pub trait RequestEncoder: Send + Sync + 'static {
    fn encode(&self, target: SocketAddr) -> Bytes;
}

/// 不添加任何请求头
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl RequestEncoder for PassThrough {
    fn encode(&self, _target: SocketAddr) -> Bytes {
        Bytes::new()
    }
}

/// 一个被 NAT 重定向的入站连接
pub struct NatSession {
    config: Arc<RelayConfig>,
    in_endpoint: SocketAddr,
    cancel: CancellationToken,
    started: Instant,
    sent: AtomicU64,
    received: AtomicU64,
}

impl ConnectionContext for NatSession {
    fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn in_endpoint(&self) -> SocketAddr {
        self.in_endpoint
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl NatSession {
    pub fn new(config: Arc<RelayConfig>, in_endpoint: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            config,
            in_endpoint,
            cancel: CancellationToken::new(),
            started: Instant::now(),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        })
    }

    /// 发往远端的字节数
    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// 从远端收到的字节数
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// 处理一个被 NAT 重定向的入站连接
    pub async fn run<E>(
        self: Arc<Self>,
        inbound: TcpStream,
        connector: OutboundConnector,
        tls: TlsConnector,
        encoder: Arc<E>,
    ) -> Result<()>
    where
        E: RequestEncoder + ?Sized,
    {
        let target = match tproxy::recover_tcp_original_destination(&inbound) {
            Ok(target) => target,
            Err(e) => {
                log_with_endpoint(self.in_endpoint, &e, Severity::Error);
                self.destroy();
                return Err(e);
            }
        };
        self.relay(inbound, target, connector, tls, encoder).await
    }

    /// 把入站连接经 TLS 隧道中继到远端，`target` 交给 `encoder` 生成请求头
    pub async fn relay<E>(
        self: Arc<Self>,
        inbound: TcpStream,
        target: SocketAddr,
        connector: OutboundConnector,
        tls: TlsConnector,
        encoder: Arc<E>,
    ) -> Result<()>
    where
        E: RequestEncoder + ?Sized,
    {
        log_with_endpoint(
            self.in_endpoint,
            format!("forwarding to {} via {}:{}", target, self.config.remote_addr, self.config.remote_port),
            Severity::All,
        );

        let (in_read, in_write) = inbound.into_split();

        // 隧道建立期间到达的数据先缓存在 upstream 中（最多一块）
        let upstream = ReadDemand::new();
        let upstream_consumed = Arc::new(Notify::new());
        let in_pump = tokio::spawn(pump(
            in_read,
            upstream.clone(),
            upstream_consumed.clone(),
            self.clone(),
            Direction::Upstream,
        ));

        let host = self.config.remote_addr.clone();
        let port = self.config.remote_port;
        let secured = match connector.connect_secure(self.as_ref(), &tls, &host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                // 连接器已经记录并销毁
                let _ = in_pump.await;
                return Err(e);
            }
        };

        let (tls_read, tls_write) = tokio::io::split(secured);
        let out_writer = SharedWriter::new(tls_write, self.cancel.clone());
        let up_coalescer = self.coalescer(&out_writer);

        let prefix = encoder.encode(target);
        if !prefix.is_empty() {
            up_coalescer.enqueue_append(prefix, || {});
        }

        let downstream = ReadDemand::new();
        let downstream_consumed = Arc::new(Notify::new());
        let out_pump = tokio::spawn(pump(
            tls_read,
            downstream.clone(),
            downstream_consumed.clone(),
            self.clone(),
            Direction::Downstream,
        ));

        let in_writer = SharedWriter::new(in_write, self.cancel.clone());
        let down_coalescer = self.coalescer(&in_writer);

        let forwards = [
            tokio::spawn(forward(upstream, up_coalescer, upstream_consumed, self.cancel.clone())),
            tokio::spawn(forward(downstream, down_coalescer, downstream_consumed, self.cancel.clone())),
        ];

        self.cancel.cancelled().await;
        for task in forwards {
            let _ = task.await;
        }

        let tls_read = out_pump.await.ok();
        let tls_write = out_writer.take().await;
        let tunnel_shutdown = match (tls_read, tls_write) {
            (Some(read), Some(write)) => Some(spawn_shutdown(self.clone(), read.unsplit(write))),
            _ => None,
        };

        // 入站 socket 随两个半边一起关闭，不等待隧道的关闭握手
        let _ = in_pump.await;
        drop(in_writer.take().await);

        if let Some(handle) = tunnel_shutdown {
            let outcome = handle.await;
            debug!("tunnel shutdown: {:?}", outcome);
        }

        log_with_endpoint(
            self.in_endpoint,
            format!(
                "disconnected, {} bytes received, {} bytes sent, lasted for {} seconds",
                self.bytes_received(),
                self.bytes_sent(),
                self.started.elapsed().as_secs()
            ),
            Severity::All,
        );
        Ok(())
    }

    fn coalescer<W>(&self, writer: &SharedWriter<W>) -> WriteCoalescer
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let coalescer = WriteCoalescer::new();
        let cancel = self.cancel.clone();
        coalescer.set_liveness_check(Arc::new(move || !cancel.is_cancelled()));
        coalescer.set_writer(writer.transport_writer());
        coalescer
    }

    fn record(&self, direction: Direction, n: usize) {
        let counter = match direction {
            Direction::Upstream => &self.sent,
            Direction::Downstream => &self.received,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// 入站 → 远端
    Upstream,
    /// 远端 → 入站
    Downstream,
}

/// 从 `reader` 读取数据交给 `demand`，每块数据被对端接受后才继续读取
///
/// EOF 或读错误销毁会话；返回读半边以便关闭时重新组合。
async fn pump<R>(
    mut reader: R,
    demand: ReadDemand,
    consumed: Arc<Notify>,
    session: Arc<NatSession>,
    direction: Direction,
) -> R
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let cancel = session.cancel.clone();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            r = reader.read(&mut buf) => match r {
                Ok(0) => {
                    debug!("{:?} reached EOF", direction);
                    session.destroy();
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    log_with_endpoint(session.in_endpoint, format!("{:?} read error: {}", direction, e), Severity::Warn);
                    session.destroy();
                    break;
                }
            },
        };

        session.record(direction, n);
        demand.offer(Bytes::copy_from_slice(&buf[..n]));

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = consumed.notified() => {}
        }
    }
    reader
}

/// 把 `demand` 中的数据交给 `coalescer`，数据被传输层接受后通知读端
async fn forward(
    demand: ReadDemand,
    coalescer: WriteCoalescer,
    consumed: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = demand.read() => data,
        };
        if data.is_empty() {
            continue;
        }
        let consumed = consumed.clone();
        coalescer.enqueue_append(data, move || consumed.notify_one());
    }
}
