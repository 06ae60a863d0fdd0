use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::packet::{encode_data, opcode_of, ErrCode, ErrorPacket, OpCode, Packet, ReadRequest};
use crate::source::{FileSource, Payload};
use crate::{Config, HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the ACK of the outstanding block
    Active,
    Completed,
    Aborted,
}

/// What the session has to do after an inbound datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Send(Bytes),
    Idle,
    Done,
}

/// Block sequencing and retry bookkeeping for one read transfer.
///
/// Holds no socket or timer: the owning [`Session`] feeds it datagrams and
/// timer expiries and transmits whatever it hands back.
pub struct Transfer {
    payload: Payload,
    block: u16,
    last_sent: Bytes,
    retries_left: u8,
    max_retries: u8,
    block_size: usize,
    state: State,
}

impl Transfer {
    pub fn new(payload: Payload, block_size: usize, max_retries: u8) -> Self {
        Self {
            payload,
            block: 0,
            last_sent: Bytes::new(),
            retries_left: max_retries,
            max_retries,
            block_size,
            state: State::Active,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The outstanding block number, 0 before the first block is sent.
    pub fn block(&self) -> u16 {
        self.block
    }

    /// Reads the next block from the payload and makes it the outstanding one.
    pub fn next_block(&mut self) -> Result<Bytes, SessionError> {
        let block = self.block.wrapping_add(1);
        let datagram = match encode_data(block, &mut self.payload, self.block_size) {
            Ok(datagram) => datagram,
            Err(err) => return Err(self.abort(SessionError::PayloadRead(err))),
        };

        self.block = block;
        self.last_sent = Bytes::from(datagram);
        self.retries_left = self.max_retries;
        Ok(self.last_sent.clone())
    }

    pub fn on_datagram(&mut self, buf: &[u8]) -> Result<Step, SessionError> {
        if self.state != State::Active {
            return Ok(Step::Idle);
        }

        // the client is giving up; never answer it, however badly the error is formed
        if opcode_of(buf) == Some(OpCode::Error as u16) {
            let err = ErrorPacket::decode(buf)
                .unwrap_or_else(|e| ErrorPacket::new(ErrCode::Undefined, e.to_string()));
            return Err(self.abort(SessionError::ClientError {
                code: err.code,
                message: err.message,
            }));
        }

        match Packet::decode(buf) {
            Ok(Packet::Ack(ack)) if ack.block == self.block && !self.last_sent.is_empty() => {
                if self.last_sent.len() - HEADER_SIZE < self.block_size {
                    self.state = State::Completed;
                    Ok(Step::Done)
                } else {
                    self.next_block().map(Step::Send)
                }
            }
            // stale or duplicate
            Ok(Packet::Ack(_)) => Ok(Step::Idle),
            Ok(other) => Err(self.abort(SessionError::Unexpected(other.opcode()))),
            Err(err) => Err(self.abort(err.into())),
        }
    }

    /// Hands back the outstanding datagram for retransmission, or gives up once
    /// the retry budget for this block is spent.
    pub fn on_timeout(&mut self) -> Result<Bytes, SessionError> {
        if self.retries_left == 0 {
            return Err(self.abort(SessionError::RetryExhausted {
                block: self.block,
                retries: self.max_retries,
            }));
        }
        self.retries_left -= 1;
        Ok(self.last_sent.clone())
    }

    fn abort(&mut self, err: SessionError) -> SessionError {
        self.state = State::Aborted;
        err
    }
}

/// One client's transfer, driven by its own task.
pub struct Session {
    client: SocketAddr,
    socket: Arc<UdpSocket>,
    config: Arc<Config>,
}

impl Session {
    pub fn new(client: SocketAddr, socket: Arc<UdpSocket>, config: Arc<Config>) -> Self {
        Self {
            client,
            socket,
            config,
        }
    }

    /// Serves `request` until it completes or aborts. Datagrams from the client
    /// arrive through `inbox`; flipping `shutdown` to true stops the session.
    pub async fn run(
        self,
        source: &dyn FileSource,
        request: ReadRequest,
        mut inbox: mpsc::Receiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let result = match source.open(&request.filename) {
            Ok(payload) => {
                let mut transfer =
                    Transfer::new(payload, self.config.block_size, self.config.retries);
                self.drive(&mut transfer, &mut inbox, &mut shutdown).await
            }
            Err(err) => Err(SessionError::PayloadRead(err)),
        };

        match &result {
            Ok(()) => info!(client = %self.client, file = %request.filename, "transfer complete"),
            Err(SessionError::Cancelled) => debug!(client = %self.client, "session cancelled"),
            Err(err) => {
                warn!(client = %self.client, file = %request.filename, "transfer aborted: {err}");
                if let Some(reply) = err.reply() {
                    if let Err(e) = self.socket.send_to(&reply.encode(), self.client).await {
                        debug!(client = %self.client, "failed to send error packet: {e}");
                    }
                }
            }
        }
        result
    }

    async fn drive(
        &self,
        transfer: &mut Transfer,
        inbox: &mut mpsc::Receiver<Bytes>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        if *shutdown.borrow() {
            return Err(SessionError::Cancelled);
        }

        let first = transfer.next_block()?;
        self.send(&first).await?;

        let timer = time::sleep(self.config.timeout);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                // the flag only ever flips to true
                _ = shutdown.changed() => return Err(SessionError::Cancelled),
                datagram = inbox.recv() => {
                    let Some(datagram) = datagram else {
                        return Err(SessionError::Cancelled);
                    };
                    match transfer.on_datagram(&datagram)? {
                        Step::Send(next) => {
                            self.send(&next).await?;
                            timer.as_mut().reset(Instant::now() + self.config.timeout);
                        }
                        Step::Idle => {}
                        Step::Done => return Ok(()),
                    }
                }
                () = &mut timer => {
                    let resend = transfer.on_timeout()?;
                    debug!(client = %self.client, block = transfer.block(), "retransmitting");
                    self.send(&resend).await?;
                    timer.as_mut().reset(Instant::now() + self.config.timeout);
                }
            }
        }
    }

    async fn send(&self, datagram: &[u8]) -> Result<(), SessionError> {
        self.socket
            .send_to(datagram, self.client)
            .await
            .map(drop)
            .map_err(SessionError::Transport)
    }
}
