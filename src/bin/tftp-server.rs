use anyhow::Result;
use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tftp_udp::tftp;
use tftp_udp::{ExecStrategy, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(version, about = "TFTP server", long_about = None)]
struct Cli {
    /// Port to listen on for incoming requests.
    #[arg(short, long, default_value_t = tftp::DEFAULT_PORT)]
    port: u16,

    /// Seconds without an answer after which a transfer fails.
    #[arg(short, long, default_value_t = tftp::DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Directory served files are read from and stored into.
    #[arg(short, long, default_value = ".")]
    cwd: PathBuf,

    /// Handle each request in its own task instead of one at a time.
    #[arg(long)]
    thread: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = ServerConfig {
        listen: (Ipv4Addr::UNSPECIFIED, cli.port).into(),
        timeout: Duration::from_secs(cli.timeout),
        root: cli.cwd,
        strategy: if cli.thread {
            ExecStrategy::ConcurrentTask
        } else {
            ExecStrategy::SynchronousInline
        },
        ..ServerConfig::default()
    };

    let mut server = Server::bind(config)?;
    log::info!("Listening on {}", server.local_addr());
    server.run().await?;
    Ok(())
}
