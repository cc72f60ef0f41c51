/// 自定义错误类型
///
/// 使用 thiserror 定义中继核心的错误分类，调用者可以据此决定
/// 丢弃连接、丢弃数据报，或者回退到显式目标
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 中继核心的主要错误类型
#[derive(Error, Debug)]
pub enum RelayError {
    /// 域名解析失败（包括解析结果为空）
    #[error("cannot resolve remote server hostname {host}:{port} reason: {reason}")]
    Resolution {
        host: String,
        port: u16,
        reason: String,
    },

    /// 连接失败
    #[error("cannot establish connection to remote server {addr} reason: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 连接超时
    #[error("cannot establish connection to remote server {addr} reason: timeout after {duration:?}")]
    ConnectTimeout { addr: String, duration: Duration },

    /// TLS 握手失败
    #[error("SSL handshake failed with {addr} reason: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 传输层已关闭
    #[error("transport closed")]
    TransportClosed,

    /// 无法取得原始目标地址（连接未经过 NAT 重定向）
    #[error("original destination unavailable: {reason}")]
    DestinationUnavailable { reason: String },

    /// 控制消息缺失或格式错误
    #[error("malformed ancillary data: {0}")]
    MalformedAncillaryData(String),

    /// 数据报超出接收缓冲区被内核截断
    #[error("datagram truncated to {limit} bytes")]
    DatagramTruncated { limit: usize },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// 创建解析失败错误
    pub fn resolution(host: impl Into<String>, port: u16, reason: impl Into<String>) -> Self {
        Self::Resolution {
            host: host.into(),
            port,
            reason: reason.into(),
        }
    }

    /// 创建连接失败错误
    pub fn connect(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            addr: addr.into(),
            source,
        }
    }

    /// 创建连接超时错误
    pub fn connect_timeout(addr: impl Into<String>, duration: Duration) -> Self {
        Self::ConnectTimeout {
            addr: addr.into(),
            duration,
        }
    }

    /// 创建握手失败错误
    pub fn handshake(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Handshake {
            addr: addr.into(),
            source,
        }
    }

    pub fn destination_unavailable(reason: impl Into<String>) -> Self {
        Self::DestinationUnavailable {
            reason: reason.into(),
        }
    }

    pub fn malformed_ancillary(msg: impl Into<String>) -> Self {
        Self::MalformedAncillaryData(msg.into())
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 是否为连接阶段的失败（包括超时）
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::ConnectTimeout { .. })
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. })
    }

    pub fn is_destination_unavailable(&self) -> bool {
        matches!(self, Self::DestinationUnavailable { .. })
    }

    pub fn is_malformed_ancillary(&self) -> bool {
        matches!(self, Self::MalformedAncillaryData(_))
    }
}
