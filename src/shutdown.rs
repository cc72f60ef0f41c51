/// 有界时间的 TLS 关闭
///
/// 优雅关闭（发送 close_notify 并等待对端的 close_notify）与 30 秒截止时间
/// 竞争，任一先结束都会进入同一个收尾步骤：强制关闭底层 socket 的两个方向。
use socket2::SockRef;
use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// 优雅关闭的截止时间
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// 可以被安全关闭的传输层
pub trait SecuredTransport: AsyncRead + AsyncWrite + Unpin + Send {
    /// 底层连接是否仍然打开
    fn is_open(&self) -> bool;

    /// 强制关闭底层连接的两个方向，忽略错误
    fn force_close(&mut self);
}

fn tcp_is_open(tcp: &TcpStream) -> bool {
    tcp.peer_addr().is_ok()
}

fn tcp_force_close(tcp: &TcpStream) {
    if let Err(e) = SockRef::from(tcp).shutdown(Shutdown::Both) {
        trace!("socket shutdown: {}", e);
    }
}

impl SecuredTransport for TcpStream {
    fn is_open(&self) -> bool {
        tcp_is_open(self)
    }

    fn force_close(&mut self) {
        tcp_force_close(self);
    }
}

impl SecuredTransport for tokio_rustls::client::TlsStream<TcpStream> {
    fn is_open(&self) -> bool {
        tcp_is_open(self.get_ref().0)
    }

    fn force_close(&mut self) {
        tcp_force_close(self.get_ref().0);
    }
}

impl SecuredTransport for tokio_rustls::server::TlsStream<TcpStream> {
    fn is_open(&self) -> bool {
        tcp_is_open(self.get_ref().0)
    }

    fn force_close(&mut self) {
        tcp_force_close(self.get_ref().0);
    }
}

/// 关闭的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// 调用前已经关闭，什么也没做
    AlreadyClosed,
    /// 优雅关闭在截止时间前完成
    Graceful,
    /// 截止时间到期或关闭握手出错，走了强制关闭
    Forced,
}

/// 使用默认截止时间关闭
pub async fn shutdown_secure<T: SecuredTransport + ?Sized>(stream: &mut T) -> ShutdownOutcome {
    shutdown_with_deadline(stream, SHUTDOWN_DEADLINE).await
}

/// 优雅关闭与 `deadline` 竞争，收尾只执行一次
pub async fn shutdown_with_deadline<T: SecuredTransport + ?Sized>(
    stream: &mut T,
    deadline: Duration,
) -> ShutdownOutcome {
    if !stream.is_open() {
        return ShutdownOutcome::AlreadyClosed;
    }

    let outcome = tokio::select! {
        result = close_and_drain(stream) => match result {
            Ok(()) => ShutdownOutcome::Graceful,
            Err(e) if is_benign(&e) => {
                trace!("graceful shutdown interrupted: {}", e);
                ShutdownOutcome::Graceful
            }
            Err(e) => {
                debug!("graceful shutdown failed: {}", e);
                ShutdownOutcome::Forced
            }
        },
        _ = tokio::time::sleep(deadline) => {
            debug!("graceful shutdown timed out after {:?}", deadline);
            ShutdownOutcome::Forced
        }
    };

    // 两条路径共用的收尾，select 保证计时器和关闭 future 都已被丢弃
    stream.force_close();
    outcome
}

/// 在后台关闭传输层
///
/// 任务持有 `owner`，所属连接至少存活到关闭结束。
pub fn spawn_shutdown<O, T>(owner: Arc<O>, mut stream: T) -> JoinHandle<ShutdownOutcome>
where
    O: ?Sized + Send + Sync + 'static,
    T: SecuredTransport + 'static,
{
    tokio::spawn(async move {
        let outcome = shutdown_secure(&mut stream).await;
        drop(owner);
        outcome
    })
}

/// 发送关闭通知，然后丢弃剩余数据直到对端确认关闭（读到 EOF）
async fn close_and_drain<T: SecuredTransport + ?Sized>(stream: &mut T) -> io::Result<()> {
    stream.shutdown().await?;

    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        trace!("discarded {} bytes while closing", n);
    }
}

/// 已取消的 I/O 和已经断开的连接不算错误
fn is_benign(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
    )
}
