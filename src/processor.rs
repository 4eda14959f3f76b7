// This module contains the packet-processing half of a transfer.
//
// A transfer is a strict ping-pong: one side sends DATA blocks and waits for
// the matching ACK before reading the next block, the other side waits for
// DATA, appends it to its file and answers with an ACK. Both sides are built
// from the same two pieces: a processor (this module) that holds the open
// file, the block counter and the negotiated block size, and a driver
// (conn.rs) that moves packets between the processor and the socket.
//
// The processor is handed one decoded packet at a time and answers with a
// ResultAction telling the driver what to do next. It never touches the
// socket itself, which keeps it testable with literal packets and a scratch
// file.

use crate::tftp::{self, Packet};
use std::error;
use std::fmt;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// Represents an action that the caller of a processor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(Packet),

    /// Caller should send the packet; the transfer is then complete and no
    /// response is awaited.
    TerminateWithPacket(Packet),

    /// Caller should close the connection without sending anything further.
    CloseConnection,
}

/// An error that aborts the transfer which raised it.
#[derive(Debug)]
pub enum TransferError {
    /// Socket-level failure: I/O, a malformed datagram, or a receive timeout.
    Socket(tftp::SocketError),

    /// The peer acknowledged or sent a block out of sequence.
    SequenceMismatch { expected: u16, got: u16 },

    /// The peer sent a packet of the wrong kind for this point in the
    /// transfer.
    UnexpectedPacket(String),

    /// The local file could not be read or written.
    File(io::Error),

    /// A state the transfer machinery should never reach.
    Internal(String),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "{}", e),
            Self::SequenceMismatch { expected, got } => write!(
                f,
                "Block sequence mismatch: expected block {expected}, peer answered with {got}"
            ),
            Self::UnexpectedPacket(msg) => write!(f, "Unexpected packet: {}", msg),
            Self::File(e) => write!(f, "File IO error: {:#?}", e),
            Self::Internal(msg) => write!(f, "Internal error: {:#?}", msg),
        }
    }
}

impl From<tftp::SocketError> for TransferError {
    fn from(e: tftp::SocketError) -> Self {
        TransferError::Socket(e)
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::File(e)
    }
}

/// The sending side of a transfer: reads blocks from a file and turns the
/// peer's ACKs into further DATA packets.
///
/// The first DATA packet carries block 0. A block shorter than the block
/// size, including an empty one, is the last packet of the transfer and is
/// not acknowledged; consequently a file whose length is an exact multiple of
/// the block size ends with a trailing empty DATA packet.
#[derive(Debug)]
pub struct BlockSender {
    f: File,
    blksize: usize,
    curr_block: u16,
}

impl BlockSender {
    pub fn new(f: File, blksize: usize) -> BlockSender {
        BlockSender { f, blksize, curr_block: 0 }
    }

    /// Produces the opening DATA packet, before any ACK has been seen.
    pub async fn first_packet(&mut self) -> Result<ResultAction, TransferError> {
        self.next_data().await
    }

    pub async fn process_ack(&mut self, packet: &Packet) -> Result<ResultAction, TransferError> {
        match packet {
            &Packet::Ack { block } if block == self.curr_block => {
                self.curr_block = self.curr_block.wrapping_add(1);
                self.next_data().await
            }
            &Packet::Ack { block } => Err(TransferError::SequenceMismatch {
                expected: self.curr_block,
                got: block,
            }),
            other => Err(TransferError::UnexpectedPacket(format!(
                "Expected an Ack for block {}, but got {other}",
                self.curr_block
            ))),
        }
    }

    async fn next_data(&mut self) -> Result<ResultAction, TransferError> {
        let data = read_block_from_file(&mut self.f, self.blksize).await?;
        let last = data.len() < self.blksize;
        let packet = Packet::Data { block: self.curr_block, data };
        if last {
            Ok(ResultAction::TerminateWithPacket(packet))
        } else {
            Ok(ResultAction::SendPacketAndAwait(packet))
        }
    }
}

/// Reads up to `blksize` bytes from the file. A single read call may return
/// less than was asked for without being at EOF, so keep reading until the
/// block is full or the file runs out.
async fn read_block_from_file(f: &mut File, blksize: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; blksize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = f.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// The receiving side of a transfer: appends incoming DATA blocks to a file
/// and answers each with an ACK carrying the received block number.
///
/// A payload shorter than the block size marks the last block. A short but
/// non-empty final block is written and acknowledged; an empty final block is
/// neither written nor acknowledged.
#[derive(Debug)]
pub struct BlockReceiver {
    f: File,
    blksize: usize,
    curr_block: u16,
}

impl BlockReceiver {
    pub fn new(f: File, blksize: usize) -> BlockReceiver {
        BlockReceiver { f, blksize, curr_block: 0 }
    }

    pub async fn process_data(&mut self, packet: &Packet) -> Result<ResultAction, TransferError> {
        match packet {
            Packet::Data { block, data } => {
                if data.is_empty() {
                    self.f.flush().await?;
                    return Ok(ResultAction::CloseConnection);
                }
                if *block != self.curr_block {
                    return Err(TransferError::SequenceMismatch {
                        expected: self.curr_block,
                        got: *block,
                    });
                }

                self.f.write_all(data).await?;
                let ack = Packet::Ack { block: *block };
                self.curr_block = self.curr_block.wrapping_add(1);

                if data.len() < self.blksize {
                    self.f.flush().await?;
                    Ok(ResultAction::TerminateWithPacket(ack))
                } else {
                    Ok(ResultAction::SendPacketAndAwait(ack))
                }
            }
            other => Err(TransferError::UnexpectedPacket(format!(
                "Expected a Data packet for block {}, but got {other}",
                self.curr_block
            ))),
        }
    }
}
