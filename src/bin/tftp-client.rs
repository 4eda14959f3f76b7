use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tftp_udp::tftp;
use tftp_udp::{Client, ClientConfig};

#[derive(Parser, Debug)]
#[command(version, about = "TFTP client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Server port to send the request to.
    #[arg(short, long, global = true, default_value_t = tftp::DEFAULT_PORT)]
    port: u16,

    /// Seconds without an answer after which the transfer fails.
    #[arg(short, long, global = true, default_value_t = tftp::DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Block size to negotiate for the transfer.
    #[arg(short, long, global = true, default_value_t = tftp::DEFAULT_BLOCK_SIZE)]
    blocksize: usize,

    /// Directory local files are read from and written into.
    #[arg(short, long, global = true)]
    cwd: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a file from the server.
    Get {
        host: String,
        filename: String,
        /// Local name to store the file under; defaults to the remote name.
        targetname: Option<String>,
    },
    /// Upload a file to the server.
    Put {
        host: String,
        filename: String,
        /// Remote name to store the file under; defaults to the local name.
        targetname: Option<String>,
    },
}

fn resolve_server(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Cannot resolve host '{host}'"))?
        .next()
        .with_context(|| format!("Host '{host}' resolved to no addresses"))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(cwd) = &cli.cwd {
        std::env::set_current_dir(cwd)
            .with_context(|| format!("Cannot change working directory to {}", cwd.display()))?;
    }

    let host = match &cli.command {
        Command::Get { host, .. } | Command::Put { host, .. } => host.clone(),
    };
    let config = ClientConfig {
        server: resolve_server(&host, cli.port)?,
        blksize: cli.blocksize,
        timeout: Duration::from_secs(cli.timeout),
    };
    let client = Client::new(config);

    match cli.command {
        Command::Get { filename, targetname, .. } => {
            let local = targetname.unwrap_or_else(|| filename.clone());
            client
                .get(&filename, Path::new(&local))
                .await
                .with_context(|| format!("Failed to fetch '{filename}' from {host}"))?;
            log::info!("Fetched '{filename}' into '{local}'");
        }
        Command::Put { filename, targetname, .. } => {
            let remote = targetname.unwrap_or_else(|| filename.clone());
            client
                .put(Path::new(&filename), &remote)
                .await
                .with_context(|| format!("Failed to push '{filename}' to {host}"))?;
            log::info!("Pushed '{filename}' as '{remote}'");
        }
    }

    Ok(())
}
