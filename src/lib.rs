//! A TFTP client and server over UDP.
//!
//! Transfers begin with a request to read or write a file. The file then
//! moves in blocks of a fixed size, default 512 bytes; every DATA packet
//! carries one block and must be acknowledged before the next one is sent,
//! so each side has exactly one unacknowledged packet in flight at any time.
//! A block shorter than the block size, including an empty one, marks the
//! end of the transfer; a file whose length is an exact multiple of the
//! block size is therefore followed by one empty DATA packet.
//!
//! Packet layouts, big-endian throughout, no checksum beyond UDP's:
//!
//! ```text
//! opcode   operation
//! 1        Read request  (RRQ):  u16 opcode | filename 0 | mode 0
//!                                [| "blksize" 0 | decimal size 0]
//! 2        Write request (WRQ):  same layout as RRQ
//! 3        Data          (DATA): u16 opcode | u16 block | 0..blksize bytes
//! 4        Acknowledgment (ACK): u16 4      | u16 block
//! ```
//!
//! Requests go to the server's listening port, 6969 by default. The server
//! answers each request from a fresh socket on a transfer-specific port, and
//! both sides then talk only through that pairing; block numbers count up
//! from 0. A write request is granted with an ACK for block 0 before any
//! data flows. The `blksize` request option carries a non-default block size,
//! which applies to that transfer only.
//!
//! There is no retransmission and no error opcode in this dialect: a receive
//! timeout, a malformed datagram, or an out-of-sequence block number simply
//! aborts the transfer that saw it.

pub mod client;
pub mod conn;
pub mod processor;
pub mod server;
pub mod tftp;

pub use client::{Client, ClientConfig};
pub use server::{ExecStrategy, Server, ServerConfig};
