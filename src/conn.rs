// This module contains the socket-driving half of a transfer.
//
// A TransferContext owns the per-transfer socket, the peer address and the
// receive timeout. The peer address may start out unknown: the side that
// opened the conversation with a request learns it from the first datagram
// the peer answers with, since the answering side replies from a
// transfer-specific port rather than the well-known listening port. Once
// locked, datagrams from any other source are logged and skipped while
// waiting for the peer.
//
// run_send and run_recv step a processor (processor.rs) against the socket
// until it reports the transfer complete or an error unwinds it. There is no
// retransmission: a receive that exceeds the timeout fails the transfer.

use crate::processor::{BlockReceiver, BlockSender, ResultAction, TransferError};
use crate::tftp::{Packet, TftpSocket};
use std::net::SocketAddr;
use std::time::Duration;

/// The mutable state of one in-progress transfer. Exclusively owns its
/// socket; the socket is released when the context is dropped, on every exit
/// path.
pub struct TransferContext {
    sock: TftpSocket,
    peer: Option<SocketAddr>,
    timeout: Duration,
}

impl TransferContext {
    pub fn new(sock: TftpSocket, peer: Option<SocketAddr>, timeout: Duration) -> TransferContext {
        TransferContext { sock, peer, timeout }
    }

    /// The peer this transfer is locked to, once the first datagram has been
    /// received (or the peer was known up front).
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Sends a packet to the locked peer.
    pub async fn send_to_peer(&mut self, packet: &Packet) -> Result<(), TransferError> {
        let peer = self.peer.ok_or_else(|| {
            TransferError::Internal("Attempted to send before the peer address was known".to_string())
        })?;
        self.sock.send(packet, peer).await?;
        Ok(())
    }

    /// Receives the next packet from the transfer's peer, bounded by the
    /// configured timeout. The first datagram fixes the peer address;
    /// afterwards, datagrams from other sources are discarded and the wait
    /// continues.
    pub async fn recv_from_peer(&mut self) -> Result<Packet, TransferError> {
        loop {
            let (packet, src) = self.sock.recv_with_timeout(self.timeout).await?;
            match self.peer {
                Some(peer) if src != peer => {
                    log::warn!(
                        "Ignoring packet from {src}: this transfer is locked to peer {peer}"
                    );
                    continue;
                }
                _ => {
                    self.peer = Some(src);
                    return Ok(packet);
                }
            }
        }
    }

    /// Runs the send direction to completion: DATA out, ACK in, one block at
    /// a time, finishing with the short or empty block that needs no ACK.
    pub async fn run_send(&mut self, mut sender: BlockSender) -> Result<(), TransferError> {
        let mut action = sender.first_packet().await?;
        loop {
            match action {
                ResultAction::SendPacketAndAwait(packet) => {
                    self.send_to_peer(&packet).await?;
                    let reply = self.recv_from_peer().await?;
                    action = sender.process_ack(&reply).await?;
                }
                ResultAction::TerminateWithPacket(packet) => {
                    self.send_to_peer(&packet).await?;
                    return Ok(());
                }
                ResultAction::CloseConnection => return Ok(()),
            }
        }
    }

    /// Runs the receive direction to completion: DATA in, ACK out, until a
    /// short or empty block ends the transfer.
    pub async fn run_recv(&mut self, mut receiver: BlockReceiver) -> Result<(), TransferError> {
        loop {
            let packet = self.recv_from_peer().await?;
            match receiver.process_data(&packet).await? {
                ResultAction::SendPacketAndAwait(ack) => self.send_to_peer(&ack).await?,
                ResultAction::TerminateWithPacket(ack) => {
                    self.send_to_peer(&ack).await?;
                    return Ok(());
                }
                ResultAction::CloseConnection => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::{self, SocketError};
    use std::net::Ipv4Addr;
    use tempdir::TempDir;
    use tokio::fs::File;
    use tokio_test::assert_ok;

    fn loopback_socket() -> TftpSocket {
        TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap()
    }

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_run_recv_locks_peer_and_acks() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("dst.bin");

        let mut peer = loopback_socket();
        let sock = loopback_socket();
        let transfer_addr = sock.local_addr();
        let mut ctx = TransferContext::new(sock, None, TEST_TIMEOUT);

        let f = File::create(&path).await.unwrap();
        let receiver = BlockReceiver::new(f, 4);

        let script = async {
            peer.send(&Packet::Data { block: 0, data: b"abcd".to_vec() }, transfer_addr)
                .await
                .unwrap();
            let (ack, _) = peer.recv_with_timeout(TEST_TIMEOUT).await.unwrap();
            assert_eq!(ack, Packet::Ack { block: 0 });

            peer.send(&Packet::Data { block: 1, data: b"ef".to_vec() }, transfer_addr)
                .await
                .unwrap();
            let (ack, _) = peer.recv_with_timeout(TEST_TIMEOUT).await.unwrap();
            assert_eq!(ack, Packet::Ack { block: 1 });
        };

        let (recv_result, ()) = tokio::join!(ctx.run_recv(receiver), script);
        assert_ok!(recv_result);

        assert_eq!(ctx.peer(), Some(peer.local_addr()));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_run_recv_skips_unexpected_sources() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("dst.bin");

        let mut peer = loopback_socket();
        let mut stranger = loopback_socket();
        let sock = loopback_socket();
        let transfer_addr = sock.local_addr();
        let mut ctx = TransferContext::new(sock, None, TEST_TIMEOUT);

        let f = File::create(&path).await.unwrap();
        let receiver = BlockReceiver::new(f, 4);

        let script = async {
            peer.send(&Packet::Data { block: 0, data: b"abcd".to_vec() }, transfer_addr)
                .await
                .unwrap();
            let (ack, _) = peer.recv_with_timeout(TEST_TIMEOUT).await.unwrap();
            assert_eq!(ack, Packet::Ack { block: 0 });

            // A third party injects a plausible-looking block; the transfer
            // must keep waiting for its locked peer instead of taking it.
            stranger
                .send(&Packet::Data { block: 1, data: b"XX".to_vec() }, transfer_addr)
                .await
                .unwrap();
            peer.send(&Packet::Data { block: 1, data: b"ef".to_vec() }, transfer_addr)
                .await
                .unwrap();
            let (ack, _) = peer.recv_with_timeout(TEST_TIMEOUT).await.unwrap();
            assert_eq!(ack, Packet::Ack { block: 1 });
        };

        let (recv_result, ()) = tokio::join!(ctx.run_recv(receiver), script);
        assert_ok!(recv_result);

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_run_send_times_out_without_ack() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("src.bin");
        tokio::fs::write(&path, [0x55; 8]).await.unwrap();

        // Bound to a real address that never answers.
        let silent = loopback_socket();
        let sock = loopback_socket();
        let mut ctx =
            TransferContext::new(sock, Some(silent.local_addr()), Duration::from_millis(100));

        let f = File::open(&path).await.unwrap();
        let sender = BlockSender::new(f, 4);

        let err = ctx.run_send(sender).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Socket(SocketError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_peer_is_an_error() {
        let sock = loopback_socket();
        let mut ctx = TransferContext::new(sock, None, tftp::DEFAULT_TIMEOUT);

        let err = ctx.send_to_peer(&Packet::Ack { block: 0 }).await.unwrap_err();
        assert!(matches!(err, TransferError::Internal(_)));
    }
}
