use crate::config::RelayConfig;
use crate::connector::OutboundConnector;
use crate::session::PassThrough;
use crate::{service, tls};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tproxy-tunnel")]
#[command(author, version, about = "Transparent proxy relay over TLS", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志详细程度（-v info, -vv debug, -vvv trace）
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行 NAT 中继服务
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "relay.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long, default_value = "relay.toml")]
        config: String,
    },
    /// 生成自签名证书（用于测试中继服务器）
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}

/// 执行命令
pub async fn execute_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Check { config } => check_config(config),
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            tls::generate_self_signed_cert(
                common_name,
                alt_names,
                Path::new(cert_out),
                Path::new(key_out),
            )?;
            println!("Generated self-signed certificate: {}", cert_out);
            println!("Generated private key: {}", key_out);
            Ok(())
        }
    }
}

async fn run(config_path: &str) -> Result<()> {
    info!("Loading relay configuration from: {}", config_path);
    let config = Arc::new(RelayConfig::load(config_path)?);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        signal.cancel();
    });

    service::run_nat_service(config, OutboundConnector::new(), Arc::new(PassThrough), shutdown)
        .await
}

/// 检查配置文件并输出摘要
pub fn check_config(config_path: &str) -> Result<()> {
    let config = RelayConfig::load(config_path)
        .with_context(|| format!("Invalid configuration: {}", config_path))?;

    println!("Checking configuration file: {}\n", config_path);
    println!("✓ Listen: {}", config.local_endpoint());
    println!("✓ Remote: {}:{}", config.remote_addr, config.remote_port);
    println!(
        "✓ TCP: no_delay={} keep_alive={} reuse_port={} fast_open={} connect_time_out={}s",
        config.tcp.no_delay,
        config.tcp.keep_alive,
        config.tcp.reuse_port,
        config.tcp.fast_open,
        config.tcp.connect_time_out
    );
    println!(
        "✓ SSL: verify={} sni={} reuse_session={}",
        config.ssl.verify,
        config.ssl.server_name(&config.remote_addr),
        config.ssl.reuse_session
    );
    match config.ssl.cert_path() {
        Some(path) if !path.exists() => println!("⚠ Warning: CA file not found: {:?}", path),
        Some(path) => println!("✓ CA file: {:?}", path),
        None => println!("✓ CA: system roots"),
    }

    println!("\n✓ Configuration is valid");
    Ok(())
}
