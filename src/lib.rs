/// 透明代理 TLS 中继库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod config;
pub mod connector;
pub mod error;
pub mod logging;
pub mod read_demand;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod tls;
pub mod tproxy;
pub mod write_coalescer;

// 重新导出常用类型
pub use config::{RelayConfig, SslConfig, TcpConfig};
pub use connector::{ConnectState, ConnectionContext, OutboundConnector, Resolver, SystemResolver};
pub use error::{RelayError, Result};
pub use logging::{log_with_endpoint, Severity};
pub use read_demand::ReadDemand;
pub use session::{NatSession, PassThrough, RequestEncoder};
pub use shutdown::{shutdown_secure, spawn_shutdown, SecuredTransport, ShutdownOutcome, SHUTDOWN_DEADLINE};
pub use tproxy::{OriginalDestination, TproxyDatagram, DEFAULT_PACKET_SIZE};
pub use write_coalescer::{SharedWriter, WriteCoalescer, WriteCompletion};
