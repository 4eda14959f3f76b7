use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Default server listening port.
pub const DEFAULT_PORT: u16 = 6969;

/// Default payload length of a DATA packet. A transfer that never negotiates
/// a block size uses this, and requests encoded with this value omit the
/// blksize option entirely.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Default transfer mode sent in requests.
pub const DEFAULT_MODE: &str = "octet";

/// Default receive timeout for a transfer socket.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest datagram we are willing to receive: the RFC 2348 maximum block
/// size plus the 4-byte DATA header.
pub const MAX_PACKET_SIZE: usize = 65468;

/// Option name for block size negotiation in request packets.
const OPTION_BLKSIZE: &str = "blksize";

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP socket handler or codec.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    PacketEncode(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {:#?}", e),
            SocketError::PacketEncode(e) => write!(f, "Packet encoding error: {:#?}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file the client wants to read.
        filename: String,

        /// The transfer mode string, normally "octet".
        mode: String,

        /// The block size option, if the request carries one.
        blksize: Option<usize>,
    },

    /// A write request packet
    WriteReq {
        filename: String,
        mode: String,
        blksize: Option<usize>,
    },

    /// A data packet
    Data {
        /// The block number for this data packet, starting at 0.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Packet::ReadReq { filename, mode, blksize } => match blksize {
                Some(size) => write!(f, "RRQ file={filename} mode={mode} blksize={size}"),
                None => write!(f, "RRQ file={filename} mode={mode}"),
            },
            Packet::WriteReq { filename, mode, blksize } => match blksize {
                Some(size) => write!(f, "WRQ file={filename} mode={mode} blksize={size}"),
                None => write!(f, "WRQ file={filename} mode={mode}"),
            },
            Packet::Data { block, data } => write!(f, "DATA block={block} len={}", data.len()),
            Packet::Ack { block } => write!(f, "ACK block={block}"),
        }
    }
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) + u16::from(buf[1])
}

/// Utility enum for naming the TFTP opcode retrieved from a buffer.
#[derive(Debug, PartialEq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        _ => Err(SocketError::PacketParse(format!(
            "Unknown opcode retrieved: {rawcode}"
        ))),
    }
}

fn ascii_field(buf: &[u8]) -> TftpResult<String> {
    if !buf.is_ascii() {
        return Err(SocketError::PacketParse(
            "Request field contains non-ASCII bytes".to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(buf).into_owned())
}

/// Splits a request body (everything after the opcode) on NUL bytes and
/// recovers the filename, mode and optional block size.
///
/// A minimal request splits into exactly [filename, mode, ""] and an
/// option-bearing request into [filename, mode, "blksize", value, ""]; any
/// other shape means a field terminator is missing or trailing garbage is
/// present, and the packet is rejected.
fn parse_request_fields(buf: &[u8]) -> TftpResult<(String, String, Option<usize>)> {
    let parts: Vec<&[u8]> = buf.split(|b| *b == 0x00).collect();

    match parts.len() {
        3 if parts[2].is_empty() => Ok((ascii_field(parts[0])?, ascii_field(parts[1])?, None)),
        5 if parts[4].is_empty() && parts[2] == OPTION_BLKSIZE.as_bytes() => {
            let raw_size = ascii_field(parts[3])?;
            let size = raw_size.parse::<usize>().map_err(|_| {
                SocketError::PacketParse(format!("Invalid blksize value: '{raw_size}'"))
            })?;
            Ok((ascii_field(parts[0])?, ascii_field(parts[1])?, Some(size)))
        }
        n => Err(SocketError::PacketParse(format!(
            "Request splits into {n} NUL-delimited fields, expected filename, \
             mode and optionally a blksize pair"
        ))),
    }
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (filename, mode, blksize) = parse_request_fields(&buf[2..])?;
    Ok(Packet::ReadReq { filename, mode, blksize })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (filename, mode, blksize) = parse_request_fields(&buf[2..])?;
    Ok(Packet::WriteReq { filename, mode, blksize })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[4..]) })
}

// Trailing bytes after the block number are ignored.
fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn encode_request(
    opcode: OpCode,
    filename: &str,
    mode: &str,
    blksize: Option<usize>,
) -> TftpResult<Vec<u8>> {
    if !filename.is_ascii() {
        return Err(SocketError::PacketEncode(format!(
            "Filename '{filename}' contains non-ASCII characters"
        )));
    }
    if !mode.is_ascii() {
        return Err(SocketError::PacketEncode(format!(
            "Mode '{mode}' contains non-ASCII characters"
        )));
    }

    let mut buf = Vec::with_capacity(2 + filename.len() + mode.len() + 2);
    buf.extend_from_slice(&(opcode as u16).to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0x00);

    // The option pair is omitted when the requested size is the protocol
    // default, producing the minimal request form.
    if let Some(size) = blksize {
        if size != DEFAULT_BLOCK_SIZE {
            buf.extend_from_slice(OPTION_BLKSIZE.as_bytes());
            buf.push(0x00);
            buf.extend_from_slice(size.to_string().as_bytes());
            buf.push(0x00);
        }
    }

    Ok(buf)
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 4 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
        }
    }

    /// Serializes the packet to its wire form.
    pub fn to_bytes(&self) -> TftpResult<Vec<u8>> {
        match self {
            Packet::ReadReq { filename, mode, blksize } => {
                encode_request(OpCode::Rrq, filename, mode, *blksize)
            }
            Packet::WriteReq { filename, mode, blksize } => {
                encode_request(OpCode::Wrq, filename, mode, *blksize)
            }
            Packet::Data { block, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&(OpCode::Data as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
                Ok(buf)
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&(OpCode::Ack as u16).to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                Ok(buf)
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
///
/// Every send and receive is logged with both endpoint addresses and the
/// packet summary at debug level, and the raw datagram at trace level.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
    local: SocketAddr,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        let sock = Async::<UdpSocket>::bind(addr)?;
        let local = sock.get_ref().local_addr()?;
        Ok(TftpSocket { sock, local })
    }

    /// The address this socket is bound to. Useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        let buf = packet.to_bytes()?;
        self.sock.send_to(&buf, dst).await?;
        log::debug!("[{} -> {}] sent {}", self.local, dst, packet);
        log::trace!("[{} -> {}] raw {:02x?}", self.local, dst, buf);
        Ok(())
    }

    /// Receives and parses one datagram, waiting indefinitely.
    pub async fn recv(&mut self) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = vec![0; MAX_PACKET_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;
        self.parse_received(&buf[..total_written], src)
    }

    /// Receives and parses one datagram, failing with a timeout error if
    /// nothing arrives within `ttl`.
    pub async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = vec![0; MAX_PACKET_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;
        self.parse_received(&buf[..total_written], src)
    }

    fn parse_received(&self, raw: &[u8], src: SocketAddr) -> TftpResult<(Packet, SocketAddr)> {
        let packet = Packet::parse_from_buf(raw)?;
        log::debug!("[{} <- {}] received {}", self.local, src, packet);
        log::trace!("[{} <- {}] raw {:02x?}", self.local, src, raw);
        Ok((packet, src))
    }
}
