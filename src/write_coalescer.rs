/// 写合并缓存
///
/// 每个方向最多只有一个正在进行的底层写操作。写操作进行期间新提交的数据
/// 会累积在待发送缓冲区中，等当前写完成后一次性发出，从而避免无界排队
/// 和多余的唤醒。
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::mem;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// 数据被传输层接受后触发的回调
pub type SentHandler = Box<dyn FnOnce() + Send + 'static>;

/// 执行一次异步写，并在完成时调用 `WriteCompletion::complete`
pub type TransportWriter = Arc<dyn Fn(Bytes, WriteCompletion) + Send + Sync + 'static>;

/// 写之前必须返回 true，例如 "socket 仍然打开"
///
/// 在内部锁内调用，不能回调同一个 `WriteCoalescer`
pub type LivenessCheck = Arc<dyn Fn() -> bool + Send + Sync + 'static>;

/// 已经交给传输层、尚未完成的一批数据
struct InFlightWrite {
    len: usize,
    handlers: Vec<SentHandler>,
}

struct State {
    pending: BytesMut,
    pending_handlers: Vec<SentHandler>,
    in_flight: Option<InFlightWrite>,
    writer: Option<TransportWriter>,
    is_open: LivenessCheck,
}

/// 写合并器，克隆后共享同一份状态
#[derive(Clone)]
pub struct WriteCoalescer {
    state: Arc<Mutex<State>>,
}

impl Default for WriteCoalescer {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteCoalescer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                pending: BytesMut::new(),
                pending_handlers: Vec::new(),
                in_flight: None,
                writer: None,
                is_open: Arc::new(|| true),
            })),
        }
    }

    /// 安装底层写函数，并尝试发送已经排队的数据
    pub fn set_writer(&self, writer: TransportWriter) {
        self.state.lock().writer = Some(writer);
        self.flush();
    }

    /// 安装存活检查
    pub fn set_liveness_check(&self, check: LivenessCheck) {
        self.state.lock().is_open = check;
    }

    /// 追加数据，数据被传输层接受后按提交顺序调用 `on_sent`
    pub fn enqueue_append<F>(&self, data: Bytes, on_sent: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            state.pending.extend_from_slice(&data);
            state.pending_handlers.push(Box::new(on_sent));
        }
        self.flush();
    }

    /// 把数据插入到所有已排队数据之前（用于回填已预读的字节）
    ///
    /// 插入的数据没有完成回调
    pub fn enqueue_prepend(&self, data: Bytes) {
        {
            let mut state = self.state.lock();
            let mut merged = BytesMut::with_capacity(data.len() + state.pending.len());
            merged.extend_from_slice(&data);
            merged.extend_from_slice(&state.pending);
            state.pending = merged;
        }
        self.flush();
    }

    /// 如果没有正在进行的写、传输层存活且有待发送数据，则发起一次写
    pub fn flush(&self) {
        let (writer, batch) = {
            let mut state = self.state.lock();
            if state.pending.is_empty() || state.in_flight.is_some() {
                return;
            }
            let Some(writer) = state.writer.clone() else {
                return;
            };
            if !(state.is_open)() {
                return;
            }

            let batch = state.pending.split().freeze();
            let handlers = mem::take(&mut state.pending_handlers);
            state.in_flight = Some(InFlightWrite {
                len: batch.len(),
                handlers,
            });
            (writer, batch)
        };

        trace!("coalesced write of {} bytes", batch.len());
        let completion = WriteCompletion {
            state: Some(Arc::downgrade(&self.state)),
        };
        writer(batch, completion);
    }

    /// 待发送（尚未交给传输层）的字节数
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 正在进行的写的字节数
    pub fn in_flight_len(&self) -> Option<usize> {
        self.state.lock().in_flight.as_ref().map(|f| f.len)
    }

    /// 没有待发送数据也没有正在进行的写
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_flight.is_none()
    }

    fn on_write_complete(&self, result: io::Result<()>) {
        match result {
            Ok(()) => {
                // 回调执行期间保持 in_flight，回调中新提交的数据只会排队
                let handlers = {
                    let mut state = self.state.lock();
                    state
                        .in_flight
                        .as_mut()
                        .map(|f| mem::take(&mut f.handlers))
                        .unwrap_or_default()
                };
                for handler in handlers {
                    handler();
                }
                self.state.lock().in_flight = None;
                self.flush();
            }
            Err(e) => {
                let mut state = self.state.lock();
                if let Some(failed) = state.in_flight.take() {
                    trace!("write of {} bytes failed: {}", failed.len, e);
                }
            }
        }
    }
}

/// 单次写操作的完成通知
///
/// 未调用 `complete` 就被丢弃时按写失败处理。所属的 `WriteCoalescer`
/// 已经销毁时什么也不做。
pub struct WriteCompletion {
    state: Option<Weak<Mutex<State>>>,
}

impl WriteCompletion {
    pub fn complete(mut self, result: io::Result<()>) {
        if let Some(state) = self.state.take().and_then(|w| w.upgrade()) {
            WriteCoalescer { state }.on_write_complete(result);
        }
    }
}

impl Drop for WriteCompletion {
    fn drop(&mut self) {
        if let Some(state) = self.state.take().and_then(|w| w.upgrade()) {
            WriteCoalescer { state }.on_write_complete(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "write completion dropped",
            )));
        }
    }
}

/// 把 tokio 的写半边适配为 `TransportWriter`
///
/// 每次写在独立任务里执行，取消令牌触发时写以 "operation aborted" 结束。
/// 写失败时触发取消令牌，由所属连接负责拆除。
pub struct SharedWriter<W> {
    inner: Arc<tokio::sync::Mutex<Option<W>>>,
    cancel: CancellationToken,
}

impl<W> SharedWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(Some(writer))),
            cancel,
        }
    }

    pub fn transport_writer(&self) -> TransportWriter {
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        Arc::new(move |data: Bytes, completion: WriteCompletion| {
            let inner = inner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    r = write_batch(&inner, &data) => r,
                    _ = cancel.cancelled() => Err(operation_aborted()),
                };
                if let Err(e) = &result {
                    if !cancel.is_cancelled() {
                        debug!("transport write failed: {}", e);
                        cancel.cancel();
                    }
                }
                completion.complete(result);
            });
        })
    }

    /// 取回写半边，之后的写都会失败
    pub async fn take(&self) -> Option<W> {
        self.inner.lock().await.take()
    }
}

async fn write_batch<W>(inner: &tokio::sync::Mutex<Option<W>>, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut guard = inner.lock().await;
    let writer = guard
        .as_mut()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
    writer.write_all(data).await?;
    writer.flush().await
}

pub(crate) fn operation_aborted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation aborted")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    type Writes = Arc<Mutex<Vec<(Bytes, Option<WriteCompletion>)>>>;

    /// 记录每次写，由测试手动完成
    fn recording_writer() -> (TransportWriter, Writes) {
        let writes: Writes = Arc::new(Mutex::new(Vec::new()));
        let sink = writes.clone();
        let writer: TransportWriter = Arc::new(move |data, completion| {
            sink.lock().push((data, Some(completion)));
        });
        (writer, writes)
    }

    fn complete(writes: &Writes, index: usize, result: io::Result<()>) {
        let completion = writes.lock()[index].1.take().unwrap();
        completion.complete(result);
    }

    fn delivered(writes: &Writes) -> Vec<u8> {
        writes
            .lock()
            .iter()
            .flat_map(|(data, _)| data.to_vec())
            .collect()
    }

    #[test]
    fn test_append_order_is_preserved() {
        let coalescer = WriteCoalescer::new();
        let (writer, writes) = recording_writer();
        coalescer.set_writer(writer);

        for part in ["alpha ", "beta ", "gamma ", "delta"] {
            coalescer.enqueue_append(Bytes::from(part), || {});
        }

        assert_eq!(writes.lock().len(), 1);
        complete(&writes, 0, Ok(()));
        assert_eq!(writes.lock().len(), 2);
        complete(&writes, 1, Ok(()));

        assert_eq!(delivered(&writes), b"alpha beta gamma delta");
        assert!(coalescer.is_idle());
    }

    #[test]
    fn test_single_batch_when_transport_becomes_writable() {
        let coalescer = WriteCoalescer::new();
        let open = Arc::new(AtomicBool::new(false));
        let flag = open.clone();
        coalescer.set_liveness_check(Arc::new(move || flag.load(Ordering::SeqCst)));
        let (writer, writes) = recording_writer();
        coalescer.set_writer(writer);

        coalescer.enqueue_append(Bytes::from_static(b"one"), || {});
        coalescer.enqueue_append(Bytes::from_static(b"two"), || {});
        assert!(writes.lock().is_empty());
        assert_eq!(coalescer.pending_len(), 6);

        open.store(true, Ordering::SeqCst);
        coalescer.flush();
        assert_eq!(writes.lock().len(), 1);
        assert_eq!(&writes.lock()[0].0[..], b"onetwo");
    }

    #[test]
    fn test_prepend_goes_before_queued_data() {
        let coalescer = WriteCoalescer::new();
        let (writer, writes) = recording_writer();
        coalescer.set_writer(writer);

        coalescer.enqueue_append(Bytes::from_static(b"first"), || {});
        coalescer.enqueue_append(Bytes::from_static(b"Y"), || {});
        coalescer.enqueue_prepend(Bytes::from_static(b"X"));

        complete(&writes, 0, Ok(()));
        assert_eq!(&writes.lock()[1].0[..], b"XY");
    }

    #[test]
    fn test_single_write_in_flight() {
        let coalescer = WriteCoalescer::new();
        let (writer, writes) = recording_writer();
        coalescer.set_writer(writer);

        coalescer.enqueue_append(Bytes::from_static(b"a"), || {});
        for _ in 0..10 {
            coalescer.enqueue_append(Bytes::from_static(b"b"), || {});
        }
        assert_eq!(writes.lock().len(), 1);
        assert_eq!(coalescer.in_flight_len(), Some(1));
        assert_eq!(coalescer.pending_len(), 10);

        complete(&writes, 0, Ok(()));
        assert_eq!(writes.lock().len(), 2);
        assert_eq!(&writes.lock()[1].0[..], b"bbbbbbbbbb");
    }

    #[test]
    fn test_handlers_fire_in_order_after_completion() {
        let coalescer = WriteCoalescer::new();
        let (writer, writes) = recording_writer();
        coalescer.set_writer(writer);

        let order = Arc::new(Mutex::new(Vec::new()));
        coalescer.enqueue_append(Bytes::from_static(b"0"), || {});
        for i in 1..=3 {
            let order = order.clone();
            coalescer.enqueue_append(Bytes::from_static(b"n"), move || order.lock().push(i));
        }

        complete(&writes, 0, Ok(()));
        assert!(order.lock().is_empty());
        complete(&writes, 1, Ok(()));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_write_suppresses_handlers() {
        let coalescer = WriteCoalescer::new();
        let (writer, writes) = recording_writer();
        coalescer.set_writer(writer);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        coalescer.enqueue_append(Bytes::from_static(b"lost"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        coalescer.enqueue_append(Bytes::from_static(b"queued"), || {});

        complete(&writes, 0, Err(io::ErrorKind::BrokenPipe.into()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(writes.lock().len(), 1);
        assert_eq!(coalescer.pending_len(), 6);
        assert_eq!(coalescer.in_flight_len(), None);
    }

    #[test]
    fn test_handler_may_enqueue_more() {
        let coalescer = WriteCoalescer::new();
        let (writer, writes) = recording_writer();
        coalescer.set_writer(writer);

        let again = coalescer.clone();
        coalescer.enqueue_append(Bytes::from_static(b"ping"), move || {
            again.enqueue_append(Bytes::from_static(b"pong"), || {});
        });

        complete(&writes, 0, Ok(()));
        let snapshot: Vec<Bytes> = writes.lock().iter().map(|(d, _)| d.clone()).collect();
        assert_eq!(snapshot, vec![Bytes::from_static(b"ping"), Bytes::from_static(b"pong")]);
    }

    #[test]
    fn test_synchronous_writer_drains_everything() {
        let coalescer = WriteCoalescer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        coalescer.set_writer(Arc::new(move |data: Bytes, completion: WriteCompletion| {
            sink.lock().extend_from_slice(&data);
            completion.complete(Ok(()));
        }));

        let sent = Arc::new(AtomicUsize::new(0));
        for part in ["a", "b", "c"] {
            let sent = sent.clone();
            coalescer.enqueue_append(Bytes::from(part), move || {
                sent.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(&seen.lock()[..], b"abc");
        assert_eq!(sent.load(Ordering::SeqCst), 3);
        assert!(coalescer.is_idle());
    }

    #[test]
    fn test_dropped_completion_counts_as_failure() {
        let coalescer = WriteCoalescer::new();
        let (writer, writes) = recording_writer();
        coalescer.set_writer(writer);

        coalescer.enqueue_append(Bytes::from_static(b"x"), || panic!("must not fire"));
        writes.lock()[0].1.take();
        assert_eq!(coalescer.in_flight_len(), None);
    }

    #[tokio::test]
    async fn test_shared_writer_over_duplex() {
        let (client, mut server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let shared = SharedWriter::new(client, cancel.clone());

        let coalescer = WriteCoalescer::new();
        coalescer.set_writer(shared.transport_writer());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for part in ["hello, ", "coalesced ", "world"] {
            let tx = tx.clone();
            coalescer.enqueue_append(Bytes::from(part), move || {
                let _ = tx.send(());
            });
        }
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        let mut buf = vec![0u8; 22];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello, coalesced world");

        assert!(shared.take().await.is_some());
        assert!(shared.take().await.is_none());
    }

    #[tokio::test]
    async fn test_shared_writer_failure_cancels_owner() {
        let (client, _server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let shared = SharedWriter::new(client, cancel.clone());
        let _ = shared.take().await;

        let coalescer = WriteCoalescer::new();
        coalescer.set_writer(shared.transport_writer());
        coalescer.enqueue_append(Bytes::from_static(b"lost"), || panic!("must not fire"));

        cancel.cancelled().await;
        assert!(cancel.is_cancelled());
    }
}
