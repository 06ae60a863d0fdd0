use std::fmt;
use std::io::{self, Read};
use std::str;

use thiserror::Error;

use crate::{BLOCK_SIZE, HEADER_SIZE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("invalid RRQ: {0}")]
    InvalidRequest(&'static str),
    #[error("invalid DATA: {0}")]
    InvalidData(&'static str),
    #[error("invalid ACK")]
    InvalidAck,
    #[error("invalid ERROR: {0}")]
    InvalidError(&'static str),
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u16),
}

/// Operation code carried in the first two bytes of every packet.
///
/// WRQ (2) is reserved: this server only serves reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Rrq = 1,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl OpCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rrq => "RRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error codes from RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Undefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            _ => None,
        }
    }

    /// Picks the code to report for a failed payload open or read.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::FileNotFound,
            io::ErrorKind::PermissionDenied => Self::AccessViolation,
            _ => Self::Undefined,
        }
    }
}

/// Returns the opcode of a datagram without decoding the rest of it.
pub fn opcode_of(buf: &[u8]) -> Option<u16> {
    match buf {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub filename: String,
    pub mode: String,
}

impl ReadRequest {
    pub fn new(filename: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            mode: mode.into(),
        }
    }

    /// An empty mode is sent as "octet".
    pub fn encode(&self) -> Vec<u8> {
        let mode = if self.mode.is_empty() {
            "octet"
        } else {
            self.mode.as_str()
        };

        let mut bytes = Vec::with_capacity(2 + self.filename.len() + 1 + mode.len() + 1);
        bytes.extend_from_slice(&(OpCode::Rrq as u16).to_be_bytes());
        bytes.extend_from_slice(self.filename.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(mode.as_bytes());
        bytes.push(0);
        bytes
    }

    /// Decodes an RRQ, normalizing the mode to lower case. Only "octet" is accepted.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if opcode_of(buf) != Some(OpCode::Rrq as u16) {
            return Err(PacketError::InvalidRequest("not a read request"));
        }

        let rest = &buf[2..];
        let (filename, used) =
            read_cstr(rest).ok_or(PacketError::InvalidRequest("unterminated filename"))?;
        if filename.is_empty() {
            return Err(PacketError::InvalidRequest("empty filename"));
        }
        let filename = str::from_utf8(filename)
            .map_err(|_| PacketError::InvalidRequest("filename is not valid UTF-8"))?
            .to_string();

        let (mode, _) =
            read_cstr(&rest[used..]).ok_or(PacketError::InvalidRequest("unterminated mode"))?;
        let mode = str::from_utf8(mode)
            .map_err(|_| PacketError::InvalidRequest("mode is not valid UTF-8"))?
            .to_ascii_lowercase();
        if mode != "octet" {
            return Err(PacketError::InvalidRequest("only octet mode is supported"));
        }

        Ok(Self { filename, mode })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub block: u16,
    pub payload: Vec<u8>,
}

impl Data {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&(OpCode::Data as u16).to_be_bytes());
        bytes.extend_from_slice(&self.block.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        Self::decode_with_limit(buf, BLOCK_SIZE)
    }

    /// Decodes a DATA packet whose payload may hold at most `block_size` bytes.
    pub fn decode_with_limit(buf: &[u8], block_size: usize) -> Result<Self, PacketError> {
        if buf.len() < HEADER_SIZE || buf.len() > HEADER_SIZE + block_size {
            return Err(PacketError::InvalidData("bad length"));
        }
        if opcode_of(buf) != Some(OpCode::Data as u16) {
            return Err(PacketError::InvalidData("not a data packet"));
        }

        Ok(Self {
            block: u16::from_be_bytes([buf[2], buf[3]]),
            payload: buf[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Encodes DATA `block` with up to `block_size` bytes drawn from `reader`.
///
/// A payload shorter than `block_size` marks the end of the transfer. Read
/// errors are returned as is, never turned into a short block.
pub fn encode_data<R: Read + ?Sized>(
    block: u16,
    reader: &mut R,
    block_size: usize,
) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + block_size);
    bytes.extend_from_slice(&(OpCode::Data as u16).to_be_bytes());
    bytes.extend_from_slice(&block.to_be_bytes());

    // read_to_end retries Interrupted and stops at EOF
    reader.take(block_size as u64).read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub block: u16,
}

impl Ack {
    pub fn new(block: u16) -> Self {
        Self { block }
    }

    pub fn encode(&self) -> Vec<u8> {
        let [a, b] = (OpCode::Ack as u16).to_be_bytes();
        let [c, d] = self.block.to_be_bytes();
        vec![a, b, c, d]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 4 || opcode_of(buf) != Some(OpCode::Ack as u16) {
            return Err(PacketError::InvalidAck);
        }
        Ok(Self {
            block: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: ErrCode,
    pub message: String,
}

impl ErrorPacket {
    pub fn new(code: ErrCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.message.len() + 1);
        bytes.extend_from_slice(&(OpCode::Error as u16).to_be_bytes());
        bytes.extend_from_slice(&(self.code as u16).to_be_bytes());
        bytes.extend_from_slice(self.message.as_bytes());
        bytes.push(0);
        bytes
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_SIZE || opcode_of(buf) != Some(OpCode::Error as u16) {
            return Err(PacketError::InvalidError("not an error packet"));
        }

        let code = ErrCode::from_u16(u16::from_be_bytes([buf[2], buf[3]]))
            .ok_or(PacketError::InvalidError("unknown error code"))?;
        let (message, _) = read_cstr(&buf[HEADER_SIZE..])
            .ok_or(PacketError::InvalidError("unterminated message"))?;
        // the message is for humans, keep what we can of it
        let message = String::from_utf8_lossy(message).into_owned();

        Ok(Self { code, message })
    }
}

/// Any packet this server understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest(ReadRequest),
    Data(Data),
    Ack(Ack),
    Error(ErrorPacket),
}

impl Packet {
    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadRequest(_) => OpCode::Rrq,
            Packet::Data(_) => OpCode::Data,
            Packet::Ack(_) => OpCode::Ack,
            Packet::Error(_) => OpCode::Error,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::ReadRequest(rrq) => rrq.encode(),
            Packet::Data(data) => data.encode(),
            Packet::Ack(ack) => ack.encode(),
            Packet::Error(err) => err.encode(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let opcode = opcode_of(buf).ok_or(PacketError::UnsupportedOpcode(0))?;
        match OpCode::from_u16(opcode) {
            Some(OpCode::Rrq) => ReadRequest::decode(buf).map(Packet::ReadRequest),
            Some(OpCode::Data) => Data::decode(buf).map(Packet::Data),
            Some(OpCode::Ack) => Ack::decode(buf).map(Packet::Ack),
            Some(OpCode::Error) => ErrorPacket::decode(buf).map(Packet::Error),
            None => Err(PacketError::UnsupportedOpcode(opcode)),
        }
    }
}

// Reads a NUL terminated field, returning its raw bytes and the number consumed
fn read_cstr(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = buf.iter().position(|&b| b == 0)?;
    Some((&buf[..pos], pos + 1))
}
