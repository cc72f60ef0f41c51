// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// TCP 选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// 出站连接禁用 Nagle 算法
    pub no_delay: bool,
    /// 启用 SO_KEEPALIVE
    pub keep_alive: bool,
    /// 监听 socket 设置 SO_REUSEPORT
    pub reuse_port: bool,
    /// 出站连接尝试 TCP Fast Open（平台不支持时忽略）
    pub fast_open: bool,
    /// 连接超时（秒），0 表示不设超时
    pub connect_time_out: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive: true,
            reuse_port: false,
            fast_open: false,
            connect_time_out: 10,
        }
    }
}

impl TcpConfig {
    /// 连接超时，未启用时返回 None
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_time_out > 0).then(|| Duration::from_secs(self.connect_time_out))
    }
}

/// TLS 选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    /// 是否校验服务器证书
    pub verify: bool,
    /// SNI，为空时使用 remote_addr
    pub sni: String,
    /// CA 证书路径（可选，支持 `~`）
    pub cert: Option<String>,
    /// ALPN 协议列表
    pub alpn: Vec<String>,
    /// 启用会话复用并在握手后报告是否复用
    pub reuse_session: bool,
    /// 启用 TLS 1.2 session ticket
    pub session_ticket: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            verify: true,
            sni: String::new(),
            cert: None,
            alpn: Vec::new(),
            reuse_session: true,
            session_ticket: false,
        }
    }
}

impl SslConfig {
    /// 展开后的 CA 证书路径
    pub fn cert_path(&self) -> Option<PathBuf> {
        self.cert
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
    }

    /// 实际使用的 SNI
    pub fn server_name<'a>(&'a self, remote_addr: &'a str) -> &'a str {
        if self.sni.is_empty() {
            remote_addr
        } else {
            &self.sni
        }
    }
}

/// 中继配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// NAT 监听地址
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    /// NAT 监听端口
    pub local_port: u16,
    /// 远端中继服务器地址
    pub remote_addr: String,
    /// 远端中继服务器端口
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub ssl: SslConfig,
}

fn default_local_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_remote_port() -> u16 {
    443
}

impl RelayConfig {
    /// 从文件加载配置
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let path = shellexpand::tilde(path).into_owned();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration file {}", path))?;
        Self::from_toml(&content)
    }

    /// 解析并验证 TOML 配置
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: RelayConfig =
            toml::from_str(content).context("Failed to parse relay configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_relay_config(self)
    }

    /// 监听地址 `local_addr:local_port`
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }
}
