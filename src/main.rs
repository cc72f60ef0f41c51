use anyhow::Result;
use clap::Parser;
use tproxy_tunnel::cli::{execute_command, Cli};
use tproxy_tunnel::logging::init_logging;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("tproxy-tunnel v{}", env!("CARGO_PKG_VERSION"));

    execute_command(&cli).await
}
