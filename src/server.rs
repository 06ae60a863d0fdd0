use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::packet::{opcode_of, ErrCode, ErrorPacket, OpCode, ReadRequest};
use crate::session::Session;
use crate::source::FileSource;
use crate::{Config, DATAGRAM_SIZE};

/// Route from a client address to its running session.
struct SessionHandle {
    id: u64,
    inbox: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

/// Read-only TFTP server: one UDP socket, one task per transfer.
pub struct Server {
    /// Taken on shutdown; sessions hold clones until they stop
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    config: Arc<Config>,
    source: Arc<dyn FileSource>,
    sessions: Arc<DashMap<SocketAddr, SessionHandle>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Binds the listening socket. Failing here is fatal to the server.
    pub async fn bind(config: Config, source: impl FileSource) -> anyhow::Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let local_addr = socket.local_addr()?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            local_addr,
            config: Arc::new(config),
            source: Arc::new(source),
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Receives and routes datagrams until [`Server::shutdown`] is called.
    ///
    /// Returns once every session has stopped and the socket is released.
    pub async fn serve(&self) -> anyhow::Result<()> {
        let socket = self
            .socket
            .lock()
            .clone()
            .context("server has been shut down")?;

        info!(
            "TFTP server listening on {}, timeout: {:?}, retry: {}",
            self.local_addr, self.config.timeout, self.config.retries
        );

        let result = self.receive(&socket).await;

        self.shutdown();
        drop(socket);
        self.join_sessions().await;
        info!("TFTP server stopped");
        result
    }

    /// Makes [`Server::serve`] return, cancels every live session and lets go
    /// of the listening socket.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.socket.lock().take();
    }

    async fn receive(&self, socket: &Arc<UdpSocket>) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; DATAGRAM_SIZE];

        loop {
            if *shutdown.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((num, addr)) => self.dispatch(socket, &buf[..num], addr),
                        // ICMP port unreachable from a vanished client, on some platforms
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                            debug!("ignoring connection reset: {e}");
                        }
                        Err(e) => return Err(e).context("listening socket failed"),
                    }
                }
            }
        }
    }

    async fn join_sessions(&self) {
        let addrs: Vec<SocketAddr> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for addr in addrs {
            if let Some((_, handle)) = self.sessions.remove(&addr) {
                if let Err(e) = handle.task.await {
                    warn!("{addr} session {} panicked: {e}", handle.id);
                }
            }
        }
    }

    fn dispatch(&self, socket: &Arc<UdpSocket>, datagram: &[u8], addr: SocketAddr) {
        if let Some(handle) = self.sessions.get(&addr) {
            match handle.inbox.try_send(Bytes::copy_from_slice(datagram)) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    debug!("{addr} session {} inbox full, datagram dropped", handle.id);
                    return;
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        // finished session whose task has not unregistered yet
        self.sessions.remove_if(&addr, |_, handle| handle.inbox.is_closed());

        match opcode_of(datagram) {
            Some(op) if op == OpCode::Rrq as u16 => match ReadRequest::decode(datagram) {
                Ok(request) => self.start_session(socket, addr, request),
                Err(e) => {
                    warn!("{addr} rejected read request: {e}");
                    let reply = ErrorPacket::new(ErrCode::IllegalOperation, e.to_string());
                    reject(socket, addr, reply);
                }
            },
            // late ACKs of a finished transfer, and never answer an error with an error
            Some(op) if op == OpCode::Ack as u16 || op == OpCode::Error as u16 => {
                debug!("{addr} opcode {op} outside any transfer, dropped");
            }
            Some(2) => {
                debug!("{addr} WRQ is not supported");
                let reply =
                    ErrorPacket::new(ErrCode::IllegalOperation, "write requests are not supported");
                reject(socket, addr, reply);
            }
            _ => {
                debug!("{addr} unexpected datagram outside any transfer, dropped");
                let reply = ErrorPacket::new(ErrCode::IllegalOperation, "no transfer in progress");
                reject(socket, addr, reply);
            }
        }
    }

    fn start_session(&self, socket: &Arc<UdpSocket>, addr: SocketAddr, request: ReadRequest) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (inbox, inbox_rx) = mpsc::channel(self.config.inbox_capacity);
        info!("{addr} RRQ {:?}, session {id}", request.filename);

        let session = Session::new(addr, socket.clone(), self.config.clone());
        let source = self.source.clone();
        let sessions = self.sessions.clone();
        let shutdown = self.shutdown.subscribe();

        // hold the slot so a session that ends at once cannot unregister too early
        let slot = self.sessions.entry(addr);
        let task = tokio::spawn(async move {
            let _ = session
                .run(source.as_ref(), request, inbox_rx, shutdown)
                .await;
            // a newer session may already own this address
            sessions.remove_if(&addr, |_, handle| handle.id == id);
        });
        slot.insert(SessionHandle { id, inbox, task });
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reject(socket: &UdpSocket, addr: SocketAddr, error: ErrorPacket) {
    // best effort, the receive loop never waits on a send
    if let Err(e) = socket.try_send_to(&error.encode(), addr) {
        debug!("{addr} failed to send error packet: {e}");
    }
}
