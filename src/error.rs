use std::io;

use thiserror::Error;

use crate::packet::{ErrCode, ErrorPacket, OpCode, PacketError};

/// Why a session stopped before completing its transfer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed packet: {0}")]
    Protocol(#[from] PacketError),

    #[error("unexpected {0} packet")]
    Unexpected(OpCode),

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("payload unavailable: {0}")]
    PayloadRead(#[source] io::Error),

    #[error("no ACK for block {block} after {retries} retries")]
    RetryExhausted { block: u16, retries: u8 },

    #[error("client sent error {code:?}: {message}")]
    ClientError { code: ErrCode, message: String },

    #[error("server shutting down")]
    Cancelled,
}

impl SessionError {
    /// ERROR packet owed to the client, if any.
    pub fn reply(&self) -> Option<ErrorPacket> {
        match self {
            SessionError::Protocol(err) => {
                Some(ErrorPacket::new(ErrCode::IllegalOperation, err.to_string()))
            }
            SessionError::Unexpected(opcode) => Some(ErrorPacket::new(
                ErrCode::IllegalOperation,
                format!("unexpected {opcode} packet"),
            )),
            SessionError::PayloadRead(err) => {
                Some(ErrorPacket::new(ErrCode::from_io(err), err.to_string()))
            }
            SessionError::Transport(_)
            | SessionError::RetryExhausted { .. }
            | SessionError::ClientError { .. }
            | SessionError::Cancelled => None,
        }
    }
}
