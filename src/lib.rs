mod cli;
mod config;
mod error;
pub mod packet;
mod server;
pub mod session;
mod source;

pub use crate::cli::Cli;
pub use crate::config::Config;
pub use crate::error::SessionError;
pub use crate::packet::{ErrCode, OpCode, Packet, PacketError};
pub use crate::server::Server;
pub use crate::source::{FileSource, Payload, StaticPayload};

pub const DATAGRAM_SIZE: usize = 516; // RFC 1350, avoids IP fragmentation
pub const HEADER_SIZE: usize = 4; // opcode + block number
pub const BLOCK_SIZE: usize = DATAGRAM_SIZE - HEADER_SIZE;

pub const DEF_TIMEOUT_MS: u64 = 1000;
pub const DEF_RETRY_COUNT: u8 = 5;
