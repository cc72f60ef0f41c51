/// 日志事件
///
/// 中继核心只产生以对端地址和级别为键的结构化事件，
/// 由 tracing-subscriber 决定输出位置
use std::fmt::Display;
use tracing_subscriber::EnvFilter;

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    All,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::All => "ALL",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 记录与某个连接端点相关的事件
pub fn log_with_endpoint(endpoint: impl Display, message: impl Display, severity: Severity) {
    match severity {
        Severity::All => tracing::info!(endpoint = %endpoint, "{}", message),
        Severity::Warn => tracing::warn!(endpoint = %endpoint, "{}", message),
        Severity::Error => tracing::error!(endpoint = %endpoint, "{}", message),
        Severity::Fatal => tracing::error!(endpoint = %endpoint, fatal = true, "{}", message),
    }
}

/// 根据 `-v` 的次数得到默认过滤级别
pub fn filter_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// 初始化全局日志订阅者，`RUST_LOG` 优先
pub fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_verbosity(verbose)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
