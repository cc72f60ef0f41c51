/// 读需求桥接
///
/// 把 "数据到达" 的推模型转换为 "按需读取" 的拉模型：最多缓存一块未消费的
/// 数据，最多挂起一个读者，二者不会同时存在。
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

/// 读回调
pub type ReadHandler = Box<dyn FnOnce(Bytes) + Send + 'static>;

#[derive(Default)]
struct State {
    pending: BytesMut,
    waiting: Option<ReadHandler>,
}

#[derive(Clone, Default)]
pub struct ReadDemand {
    state: Arc<Mutex<State>>,
}

impl ReadDemand {
    pub fn new() -> Self {
        Self::default()
    }

    /// 提交到达的数据：有等待中的读者则直接交付，否则追加到缓存
    pub fn offer(&self, data: Bytes) {
        let waiting = {
            let mut state = self.state.lock();
            match state.waiting.take() {
                Some(handler) => Some(handler),
                None => {
                    state.pending.extend_from_slice(&data);
                    None
                }
            }
        };
        if let Some(handler) = waiting {
            handler(data);
        }
    }

    /// 请求数据：有缓存则立即交付并清空，否则挂起直到下一次 `offer`
    ///
    /// 同一时刻只允许一个未完成的请求，调用者必须串行化读取。
    pub fn request<F>(&self, on_data: F)
    where
        F: FnOnce(Bytes) + Send + 'static,
    {
        let ready = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                debug_assert!(
                    state.waiting.is_none(),
                    "concurrent ReadDemand::request is not allowed"
                );
                if state.waiting.is_some() {
                    warn!("replacing an outstanding read request");
                }
                state.waiting = Some(Box::new(on_data));
                return;
            }
            state.pending.split().freeze()
        };
        on_data(ready);
    }

    /// `request` 的 async 形式
    ///
    /// 返回的 future 被丢弃后，下一次 `offer` 的数据会随之丢弃。
    pub async fn read(&self) -> Bytes {
        let (tx, rx) = oneshot::channel();
        self.request(move |data| {
            let _ = tx.send(data);
        });
        // 发送端只会随回调一起被丢弃，而回调只在 offer 时被取出并调用
        rx.await.unwrap_or_default()
    }

    /// 缓存中尚未消费的字节数
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn has_waiting_reader(&self) -> bool {
        self.state.lock().waiting.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_request_then_offer() {
        let demand = ReadDemand::new();
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = got.clone();

        demand.request(move |data| sink.lock().push(data));
        assert!(demand.has_waiting_reader());

        demand.offer(Bytes::from_static(b"payload"));
        assert_eq!(*got.lock(), vec![Bytes::from_static(b"payload")]);
        assert!(!demand.has_waiting_reader());
        assert_eq!(demand.pending_len(), 0);
    }

    #[test]
    fn test_offer_then_request() {
        let demand = ReadDemand::new();
        demand.offer(Bytes::from_static(b"early"));
        assert_eq!(demand.pending_len(), 5);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        demand.request(move |data| {
            assert_eq!(&data[..], b"early");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(demand.pending_len(), 0);
        assert!(!demand.has_waiting_reader());
    }

    #[test]
    fn test_consecutive_offers_accumulate_into_one_chunk() {
        let demand = ReadDemand::new();
        demand.offer(Bytes::from_static(b"ab"));
        demand.offer(Bytes::from_static(b"cd"));

        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        demand.request(move |data| *sink.lock() = Some(data));
        assert_eq!(got.lock().as_deref(), Some(&b"abcd"[..]));
    }

    #[test]
    fn test_never_both_buffered_and_waiting() {
        let demand = ReadDemand::new();
        for round in 0..4u8 {
            if round % 2 == 0 {
                demand.request(|_| {});
                demand.offer(Bytes::from(vec![round]));
            } else {
                demand.offer(Bytes::from(vec![round]));
                demand.request(|_| {});
            }
            assert!(!(demand.pending_len() > 0 && demand.has_waiting_reader()));
        }
        assert_eq!(demand.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_async_read() {
        let demand = ReadDemand::new();
        let producer = demand.clone();
        let handle = tokio::spawn(async move { producer.offer(Bytes::from_static(b"later")) });

        let data = demand.read().await;
        handle.await.unwrap();
        assert_eq!(&data[..], b"later");
    }
}
