/// NAT 监听服务
///
/// 接受被 iptables REDIRECT 重定向的 TCP 连接，为每个连接启动一个
/// `NatSession`。
use crate::config::{RelayConfig, TcpConfig};
use crate::connector::OutboundConnector;
use crate::session::{NatSession, RequestEncoder};
use crate::tls;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 最大并发连接数
const MAX_CONCURRENT_CONNECTIONS: usize = 4096;

/// 监听队列长度
const LISTEN_BACKLOG: i32 = 1024;

/// 绑定监听 socket，`reuse_port` 为 true 时设置 SO_REUSEPORT
///
/// 多个进程可以用 SO_REUSEPORT 共享同一个端口，由内核分配连接。
pub async fn bind_reuse_port_listener(addr: &str, reuse_port: bool) -> Result<TcpListener> {
    let local = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("Failed to resolve listen address {}", addr))?
        .next()
        .with_context(|| format!("No address found for {}", addr))?;

    let socket = Socket::new(Domain::for_address(local), Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create listen socket")?;
    socket
        .set_reuse_address(true)
        .context("Failed to set SO_REUSEADDR")?;
    if reuse_port {
        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .context("Failed to set SO_REUSEPORT")?;
        #[cfg(not(unix))]
        warn!("SO_REUSEPORT is not supported on this platform, ignored");
    }
    socket
        .set_nonblocking(true)
        .context("Failed to set listen socket non-blocking")?;
    socket
        .bind(&local.into())
        .with_context(|| format!("Failed to bind {}", local))?;
    socket
        .listen(LISTEN_BACKLOG)
        .with_context(|| format!("Failed to listen on {}", local))?;

    TcpListener::from_std(socket.into()).context("Failed to register listener with the runtime")
}

/// 运行 NAT 服务直到 `shutdown` 被触发
pub async fn run_nat_service<E>(
    config: Arc<RelayConfig>,
    connector: OutboundConnector,
    encoder: Arc<E>,
    shutdown: CancellationToken,
) -> Result<()>
where
    E: RequestEncoder + ?Sized,
{
    let tls = TlsConnector::from(tls::build_client_config(&config.ssl)?);
    let bind_addr = config.local_endpoint();
    let listener = bind_reuse_port_listener(&bind_addr, config.tcp.reuse_port).await?;

    info!(
        "nat service started at {}, forwarding to {}:{}",
        bind_addr, config.remote_addr, config.remote_port
    );
    serve(listener, config, connector, tls, encoder, shutdown).await
}

/// 在已绑定的 listener 上接受连接
pub async fn serve<E>(
    listener: TcpListener,
    config: Arc<RelayConfig>,
    connector: OutboundConnector,
    tls: TlsConnector,
    encoder: Arc<E>,
    shutdown: CancellationToken,
) -> Result<()>
where
    E: RequestEncoder + ?Sized,
{
    let limiter = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));

    loop {
        let (inbound, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("nat service stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // EMFILE 等错误不应终止服务
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let permit = match limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Connection limit reached ({}), rejecting connection from {}",
                    MAX_CONCURRENT_CONNECTIONS, peer_addr
                );
                continue;
            }
        };

        apply_stream_options(&inbound, &config.tcp);
        debug!("accepted connection from {}", peer_addr);

        let session = NatSession::new(config.clone(), peer_addr);
        let connector = connector.clone();
        let tls = tls.clone();
        let encoder = encoder.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = session.run(inbound, connector, tls, encoder).await {
                debug!("session {} ended: {}", peer_addr, e);
            }
        });
    }
}

/// 对入站连接应用 `[tcp]` 选项
fn apply_stream_options(stream: &TcpStream, tcp: &TcpConfig) {
    if tcp.no_delay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
    }
    if tcp.keep_alive {
        if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new()) {
            warn!("Failed to set TCP keepalive: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PassThrough;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_bind_reuse_port_twice() {
        let first = bind_reuse_port_listener("127.0.0.1:0", true).await.unwrap();
        let addr = first.local_addr().unwrap();

        let second = bind_reuse_port_listener(&addr.to_string(), true).await.unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_bind_without_reuse_port_conflicts() {
        let first = bind_reuse_port_listener("127.0.0.1:0", false).await.unwrap();
        let addr = first.local_addr().unwrap();

        assert!(bind_reuse_port_listener(&addr.to_string(), false).await.is_err());
    }

    #[tokio::test]
    async fn test_accepted_socket_options() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        apply_stream_options(&accepted, &TcpConfig::default());
        assert!(accepted.nodelay().unwrap());
        assert!(SockRef::from(&accepted).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_serve_drops_unredirected_connections() {
        let mut config = RelayConfig::from_toml(
            r#"
            local_port = 1080
            remote_addr = "127.0.0.1"
            "#,
        )
        .unwrap();
        config.ssl.verify = false;
        let tls = TlsConnector::from(tls::build_client_config(&config.ssl).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            Arc::new(config),
            OutboundConnector::new(),
            tls,
            Arc::new(PassThrough),
            shutdown.clone(),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
