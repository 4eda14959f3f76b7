// Server dispatch loop.
//
// One socket listens on the well-known port and only ever sees request
// packets. Each accepted request gets its own fresh socket bound to the
// data port for its direction, and the whole transfer runs against that
// socket so the listening port stays free for further requests. Whether the
// loop waits for a transfer to finish or keeps accepting while it runs is
// decided once at startup by the execution strategy.
//
// Nothing a handler does can take the dispatch loop down: every transfer
// failure is logged and the loop goes back to accepting.

use crate::conn::TransferContext;
use crate::processor::{BlockReceiver, BlockSender, TransferError};
use crate::tftp::{self, Packet, SocketError, TftpResult, TftpSocket};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;

/// Port a read transfer's fresh socket binds to.
pub const READ_DATA_PORT: u16 = 34208;

/// Port a write transfer's fresh socket binds to.
pub const WRITE_DATA_PORT: u16 = 34209;

/// Consecutive listening-socket failures tolerated before the server gives
/// up instead of spinning on a broken socket.
const MAX_ACCEPT_FAILURES: u32 = 5;

/// How the dispatch loop executes an accepted request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecStrategy {
    /// Run the transfer to completion before accepting the next request.
    SynchronousInline,

    /// Run each transfer as an independent task so the listening loop can
    /// immediately accept the next request.
    ConcurrentTask,
}

/// Everything the server needs to know, passed in by whoever parsed the
/// command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the request socket listens on.
    pub listen: SocketAddr,

    /// How long a transfer waits on each receive before it fails.
    pub timeout: Duration,

    /// Directory that served files are read from and stored into.
    pub root: PathBuf,

    /// Port for sockets serving read requests. Port 0 lets the OS pick.
    pub read_data_port: u16,

    /// Port for sockets accepting write requests. Port 0 lets the OS pick.
    pub write_data_port: u16,

    pub strategy: ExecStrategy,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            listen: (Ipv4Addr::UNSPECIFIED, tftp::DEFAULT_PORT).into(),
            timeout: tftp::DEFAULT_TIMEOUT,
            root: PathBuf::from("."),
            read_data_port: READ_DATA_PORT,
            write_data_port: WRITE_DATA_PORT,
            strategy: ExecStrategy::SynchronousInline,
        }
    }
}

pub struct Server {
    config: ServerConfig,
    sock: TftpSocket,
}

impl Server {
    pub fn bind(config: ServerConfig) -> TftpResult<Server> {
        let sock = TftpSocket::bind(config.listen)?;
        Ok(Server { config, sock })
    }

    /// The address the request socket ended up bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr()
    }

    /// Accepts and dispatches requests until the listening socket fails
    /// repeatedly in a row.
    pub async fn run(&mut self) -> TftpResult<()> {
        let mut accept_failures: u32 = 0;
        loop {
            let (packet, src) = match self.sock.recv().await {
                Ok(received) => {
                    accept_failures = 0;
                    received
                }
                Err(e @ SocketError::IO(_)) => {
                    accept_failures += 1;
                    log::error!(
                        "Listening socket receive failed \
                         ({accept_failures}/{MAX_ACCEPT_FAILURES}): {e}"
                    );
                    if accept_failures >= MAX_ACCEPT_FAILURES {
                        return Err(e);
                    }
                    continue;
                }
                Err(e) => {
                    // Undecodable datagrams are the sender's problem.
                    log::warn!("Dropping undecodable datagram: {e}");
                    continue;
                }
            };

            match packet {
                Packet::ReadReq { .. } | Packet::WriteReq { .. } => {
                    log::info!("Accepted request from {src}: {packet}");
                    let config = self.config.clone();
                    match self.config.strategy {
                        ExecStrategy::ConcurrentTask => {
                            tokio::spawn(handle_request(config, packet, src));
                        }
                        ExecStrategy::SynchronousInline => {
                            handle_request(config, packet, src).await;
                        }
                    }
                }
                other => {
                    log::warn!("Ignoring non-request packet from {src}: {other}");
                }
            }
        }
    }
}

/// Runs one accepted request to completion. Every failure ends here, logged;
/// none of them reach the dispatch loop.
async fn handle_request(config: ServerConfig, request: Packet, peer: SocketAddr) {
    let result = match &request {
        Packet::ReadReq { filename, blksize, .. } => {
            serve_read(&config, filename, *blksize, peer).await
        }
        Packet::WriteReq { filename, blksize, .. } => {
            accept_write(&config, filename, *blksize, peer).await
        }
        _ => Err(TransferError::Internal(
            "Dispatch loop forwarded a non-request packet".to_string(),
        )),
    };

    match result {
        Ok(()) => log::info!("Transfer with {peer} complete"),
        Err(e) => log::error!("Transfer with {peer} failed: {e}"),
    }
}

/// Serves a read request: sends the named file to the requester block by
/// block, using the block size from the request's option if it carried one.
async fn serve_read(
    config: &ServerConfig,
    filename: &str,
    blksize: Option<usize>,
    peer: SocketAddr,
) -> Result<(), TransferError> {
    let blksize = blksize.unwrap_or(tftp::DEFAULT_BLOCK_SIZE);
    let f = File::open(resolve_path(&config.root, filename)).await?;

    let sock = TftpSocket::bind((Ipv4Addr::UNSPECIFIED, config.read_data_port).into())?;
    let mut ctx = TransferContext::new(sock, Some(peer), config.timeout);
    ctx.run_send(BlockSender::new(f, blksize)).await
}

/// Accepts a write request: acknowledges the request phase with the block-0
/// ACK, then stores incoming blocks into the named file.
async fn accept_write(
    config: &ServerConfig,
    filename: &str,
    blksize: Option<usize>,
    peer: SocketAddr,
) -> Result<(), TransferError> {
    let blksize = blksize.unwrap_or(tftp::DEFAULT_BLOCK_SIZE);
    let f = File::create(resolve_path(&config.root, filename)).await?;

    let sock = TftpSocket::bind((Ipv4Addr::UNSPECIFIED, config.write_data_port).into())?;
    let mut ctx = TransferContext::new(sock, Some(peer), config.timeout);

    // The block-0 ACK both closes the request phase and tells the client
    // which port the transfer now lives on.
    ctx.send_to_peer(&Packet::Ack { block: 0 }).await?;
    ctx.run_recv(BlockReceiver::new(f, blksize)).await
}

/// Requested filenames are resolved inside the configured root; a leading
/// slash is treated as naming a path relative to that root.
fn resolve_path(root: &Path, filename: &str) -> PathBuf {
    let relative = if filename.starts_with('/') { &filename[1..] } else { filename };
    root.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path_joins_root() {
        assert_eq!(
            resolve_path(Path::new("/srv/files"), "sub/data.txt"),
            PathBuf::from("/srv/files/sub/data.txt")
        );
    }

    #[test]
    fn test_resolve_path_strips_leading_slash() {
        assert_eq!(
            resolve_path(Path::new("/srv/files"), "/data.txt"),
            PathBuf::from("/srv/files/data.txt")
        );
    }
}
