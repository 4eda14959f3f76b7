// Client role: build and send the request packet, then hand the transfer to
// the state machine in the matching direction.
//
// The request is addressed to the server's well-known port, but the server
// answers from a transfer-specific port. The transfer context therefore
// starts with no peer and locks onto whatever address the first reply
// arrives from.

use crate::conn::TransferContext;
use crate::processor::{BlockReceiver, BlockSender, TransferError};
use crate::tftp::{self, Packet, TftpSocket};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;

/// Everything a client needs to know, passed in by whoever parsed the
/// command line.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address of the server's listening socket.
    pub server: SocketAddr,

    /// Block size to use for the transfer. A non-default value is announced
    /// to the server through the blksize request option.
    pub blksize: usize,

    /// How long to wait on each receive before the transfer fails.
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> ClientConfig {
        ClientConfig {
            server,
            blksize: tftp::DEFAULT_BLOCK_SIZE,
            timeout: tftp::DEFAULT_TIMEOUT,
        }
    }
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        Client { config }
    }

    fn request_blksize(&self) -> Option<usize> {
        (self.config.blksize != tftp::DEFAULT_BLOCK_SIZE).then_some(self.config.blksize)
    }

    fn bind_transfer_socket(&self) -> Result<TftpSocket, TransferError> {
        Ok(TftpSocket::bind((Ipv4Addr::UNSPECIFIED, 0).into())?)
    }

    /// Fetches `remote` from the server and stores it at `local`.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<(), TransferError> {
        let mut sock = self.bind_transfer_socket()?;
        let request = Packet::ReadReq {
            filename: remote.to_string(),
            mode: tftp::DEFAULT_MODE.to_string(),
            blksize: self.request_blksize(),
        };
        sock.send(&request, self.config.server).await?;

        let f = File::create(local).await?;
        let mut ctx = TransferContext::new(sock, None, self.config.timeout);
        ctx.run_recv(BlockReceiver::new(f, self.config.blksize)).await
    }

    /// Pushes `local` to the server, to be stored there under `remote`.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        // Open before sending the request, so a missing local file never
        // leaves the server with a half-opened transfer.
        let f = File::open(local).await?;

        let mut sock = self.bind_transfer_socket()?;
        let request = Packet::WriteReq {
            filename: remote.to_string(),
            mode: tftp::DEFAULT_MODE.to_string(),
            blksize: self.request_blksize(),
        };
        sock.send(&request, self.config.server).await?;

        let mut ctx = TransferContext::new(sock, None, self.config.timeout);

        // The request phase closes with an ACK for block 0; the block
        // sending loop starts only after it arrives.
        match ctx.recv_from_peer().await? {
            Packet::Ack { block: 0 } => {}
            other => {
                return Err(TransferError::UnexpectedPacket(format!(
                    "Expected the opening Ack for block 0, but got {other}"
                )))
            }
        }

        ctx.run_send(BlockSender::new(f, self.config.blksize)).await
    }
}
