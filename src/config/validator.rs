use anyhow::{bail, Result};
use tracing::warn;

use super::{RelayConfig, SslConfig, TcpConfig};

/// 连接超时上限（秒）
const MAX_CONNECT_TIME_OUT: u64 = 300;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    pub fn validate_tcp_config(config: &TcpConfig) -> Result<()> {
        if config.connect_time_out > MAX_CONNECT_TIME_OUT {
            bail!(
                "tcp.connect_time_out must be at most {} seconds (current: {})",
                MAX_CONNECT_TIME_OUT,
                config.connect_time_out
            );
        }
        if config.fast_open && !cfg!(target_os = "linux") {
            warn!("tcp.fast_open is not supported on this platform and will be ignored");
        }
        Ok(())
    }

    pub fn validate_ssl_config(config: &SslConfig) -> Result<()> {
        for proto in &config.alpn {
            if proto.is_empty() || proto.len() > 255 {
                bail!("ssl.alpn entry '{}' must be 1..=255 bytes", proto);
            }
        }
        if !config.verify {
            warn!("ssl.verify is disabled; the remote certificate will not be checked");
        }
        Ok(())
    }

    /// 验证中继配置
    pub fn validate_relay_config(config: &RelayConfig) -> Result<()> {
        Self::validate_address(&config.local_addr, "local_addr")?;
        Self::validate_port(config.local_port, "local_port")?;
        Self::validate_address(&config.remote_addr, "remote_addr")?;
        Self::validate_port(config.remote_port, "remote_port")?;
        Self::validate_tcp_config(&config.tcp)?;
        Self::validate_ssl_config(&config.ssl)?;
        Ok(())
    }
}
