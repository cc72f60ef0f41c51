/// 出站连接建立
///
/// 解析 → 建立 socket 并设置选项 → 连接（可选超时）→ 可选 TLS 握手。
/// 任何一步失败都会记录原因并销毁所属连接，本模块不做重试。
use crate::config::{RelayConfig, TcpConfig};
use crate::error::{RelayError, Result};
use crate::logging::{log_with_endpoint, Severity};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 出站连接所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Resolving,
    Connecting,
    Handshaking,
    Established,
    Failed,
}

/// 发起出站连接的连接对象需要提供的能力
pub trait ConnectionContext: Send + Sync + 'static {
    /// 协议配置快照
    fn config(&self) -> &RelayConfig;

    /// 入站端点，用作日志键
    fn in_endpoint(&self) -> SocketAddr;

    /// 取消令牌，连接销毁时触发
    fn cancel_token(&self) -> &CancellationToken;

    /// 销毁连接
    fn destroy(&self) {
        self.cancel_token().cancel();
    }

    fn is_destroyed(&self) -> bool {
        self.cancel_token().is_cancelled()
    }

    /// 阶段变化通知
    fn on_state(&self, _state: ConnectState) {}
}

/// 域名解析
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// 使用系统解析器
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

/// 出站连接器
#[derive(Clone)]
pub struct OutboundConnector {
    resolver: Arc<dyn Resolver>,
}

impl Default for OutboundConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundConnector {
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver))
    }

    pub fn with_resolver(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    /// 建立到 `host:port` 的 TCP 连接
    ///
    /// 失败时记录日志并调用 `ctx.destroy()`。连接在此期间被销毁时返回
    /// `TransportClosed`，不再产生其他副作用。
    pub async fn connect<C>(&self, ctx: &C, host: &str, port: u16) -> Result<TcpStream>
    where
        C: ConnectionContext + ?Sized,
    {
        let result = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => Err(RelayError::TransportClosed),
            r = self.connect_tcp(ctx, host, port) => r,
        };
        let stream = settle(ctx, result)?;
        ctx.on_state(ConnectState::Established);
        Ok(stream)
    }

    /// 建立 TCP 连接后进行 TLS 客户端握手
    pub async fn connect_secure<C>(
        &self,
        ctx: &C,
        tls: &TlsConnector,
        host: &str,
        port: u16,
    ) -> Result<TlsStream<TcpStream>>
    where
        C: ConnectionContext + ?Sized,
    {
        let result = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => Err(RelayError::TransportClosed),
            r = self.connect_tls(ctx, tls, host, port) => r,
        };
        let stream = settle(ctx, result)?;

        let endpoint = ctx.in_endpoint();
        log_with_endpoint(endpoint, "tunnel established", Severity::All);
        if ctx.config().ssl.reuse_session {
            let reused = stream.get_ref().1.handshake_kind() == Some(rustls::HandshakeKind::Resumed);
            let message = if reused {
                "SSL session reused"
            } else {
                "SSL session not reused"
            };
            log_with_endpoint(endpoint, message, Severity::All);
        }
        ctx.on_state(ConnectState::Established);
        Ok(stream)
    }

    /// 在后台建立连接，成功且连接仍存活时调用 `on_connected`
    ///
    /// 任务持有 `ctx`，连接对象至少存活到任务结束。
    pub fn spawn_connect<C, F>(
        &self,
        ctx: Arc<C>,
        host: String,
        port: u16,
        on_connected: F,
    ) -> JoinHandle<()>
    where
        C: ConnectionContext,
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let connector = self.clone();
        tokio::spawn(async move {
            if let Ok(stream) = connector.connect(ctx.as_ref(), &host, port).await {
                if !ctx.is_destroyed() {
                    on_connected(stream);
                }
            }
        })
    }

    /// `spawn_connect` 的 TLS 版本
    pub fn spawn_connect_secure<C, F>(
        &self,
        ctx: Arc<C>,
        tls: TlsConnector,
        host: String,
        port: u16,
        on_connected: F,
    ) -> JoinHandle<()>
    where
        C: ConnectionContext,
        F: FnOnce(TlsStream<TcpStream>) + Send + 'static,
    {
        let connector = self.clone();
        tokio::spawn(async move {
            if let Ok(stream) = connector.connect_secure(ctx.as_ref(), &tls, &host, port).await {
                if !ctx.is_destroyed() {
                    on_connected(stream);
                }
            }
        })
    }

    async fn connect_tcp<C>(&self, ctx: &C, host: &str, port: u16) -> Result<TcpStream>
    where
        C: ConnectionContext + ?Sized,
    {
        ctx.on_state(ConnectState::Resolving);
        let addrs = self
            .resolver
            .resolve(host, port)
            .await
            .map_err(|e| RelayError::resolution(host, port, e.to_string()))?;
        let addr = *addrs
            .first()
            .ok_or_else(|| RelayError::resolution(host, port, "no address found"))?;
        log_with_endpoint(
            ctx.in_endpoint(),
            format!("{} is resolved to {}", host, addr.ip()),
            Severity::All,
        );

        ctx.on_state(ConnectState::Connecting);
        let target = format!("{}:{}", host, port);
        let tcp = &ctx.config().tcp;
        let socket = open_socket(addr, tcp).map_err(|e| RelayError::connect(&target, e))?;
        connect_with_deadline(socket.connect(addr), tcp.connect_timeout(), &target).await
    }

    async fn connect_tls<C>(
        &self,
        ctx: &C,
        tls: &TlsConnector,
        host: &str,
        port: u16,
    ) -> Result<TlsStream<TcpStream>>
    where
        C: ConnectionContext + ?Sized,
    {
        let tcp = self.connect_tcp(ctx, host, port).await?;

        ctx.on_state(ConnectState::Handshaking);
        let target = format!("{}:{}", host, port);
        let sni = ctx.config().ssl.server_name(host).to_string();
        let server_name = ServerName::try_from(sni)
            .map_err(|e| RelayError::handshake(&target, io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        tls.connect(server_name, tcp)
            .await
            .map_err(|e| RelayError::handshake(&target, e))
    }
}

/// 统一处理一次连接尝试的结果
fn settle<C, T>(ctx: &C, result: Result<T>) -> Result<T>
where
    C: ConnectionContext + ?Sized,
{
    match result {
        Ok(value) => Ok(value),
        // 连接已被销毁，静默返回
        Err(RelayError::TransportClosed) => Err(RelayError::TransportClosed),
        Err(e) => {
            ctx.on_state(ConnectState::Failed);
            log_with_endpoint(ctx.in_endpoint(), &e, Severity::Error);
            ctx.destroy();
            Err(e)
        }
    }
}

/// 连接与超时计时器竞争，连接先结束时计时器随之取消
async fn connect_with_deadline<F, T>(connect: F, deadline: Option<Duration>, target: &str) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        None => connect.await.map_err(|e| RelayError::connect(target, e)),
        Some(duration) => match tokio::time::timeout(duration, connect).await {
            Ok(result) => result.map_err(|e| RelayError::connect(target, e)),
            Err(_) => Err(RelayError::connect_timeout(target, duration)),
        },
    }
}

fn open_socket(addr: SocketAddr, tcp: &TcpConfig) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if tcp.no_delay {
        socket.set_nodelay(true)?;
    }
    if tcp.keep_alive {
        socket.set_keepalive(true)?;
    }
    if tcp.fast_open {
        set_fast_open_connect(&socket);
    }
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn set_fast_open_connect(socket: &TcpSocket) {
    use std::os::fd::AsRawFd;

    let Some(option) = crate::tproxy::sockopts().tcp_fastopen_connect else {
        return;
    };
    if let Err(e) =
        crate::tproxy::setsockopt_int(socket.as_raw_fd(), libc::IPPROTO_TCP, option, 1)
    {
        debug!("TCP_FASTOPEN_CONNECT not applied: {}", e);
    }
}

#[cfg(not(target_os = "linux"))]
fn set_fast_open_connect(_socket: &TcpSocket) {
    debug!("TCP_FASTOPEN_CONNECT is not supported on this platform");
}
