//! Loopback tests: a real server on an ephemeral port, driven by hand-rolled
//! clients speaking the wire format directly.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tftpd::packet::{Ack, Data, ErrorPacket, ReadRequest};
use tftpd::{Config, ErrCode, FileSource, Payload, Server, StaticPayload, BLOCK_SIZE};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const PATIENCE: Duration = Duration::from_secs(2);

struct Running {
    server: Arc<Server>,
    addr: SocketAddr,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start(payload: Vec<u8>, timeout_ms: u64, retries: u8) -> Running {
    start_with(StaticPayload::new(payload), timeout_ms, retries).await
}

async fn start_with(source: impl FileSource, timeout_ms: u64, retries: u8) -> Running {
    let config = Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        timeout: Duration::from_millis(timeout_ms),
        retries,
        ..Config::default()
    };
    let server = Arc::new(Server::bind(config, source).await.unwrap());
    let addr = server.local_addr();

    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve().await });

    Running { server, addr, task }
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("bind failed")
}

async fn recv(sock: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 1024];
    let (n, _) = timeout(PATIENCE, sock.recv_from(&mut buf))
        .await
        .expect("no datagram from server")
        .unwrap();
    buf[..n].to_vec()
}

/// Fails if the server sends anything within `window`.
async fn expect_silence(sock: &UdpSocket, window: Duration) {
    let mut buf = [0u8; 1024];
    if let Ok(received) = timeout(window, sock.recv_from(&mut buf)).await {
        let (n, _) = received.unwrap();
        panic!("unexpected datagram: {:?}", &buf[..n]);
    }
}

async fn ack(sock: &UdpSocket, server: SocketAddr, block: u16) {
    sock.send_to(&Ack::new(block).encode(), server).await.unwrap();
}

async fn request(sock: &UdpSocket, server: SocketAddr) {
    let rrq = ReadRequest::new("payload.svg", "octet").encode();
    sock.send_to(&rrq, server).await.unwrap();
}

/// Downloads the payload, checking block numbering on the way.
async fn download(sock: &UdpSocket, server: SocketAddr) -> (Vec<u8>, u16) {
    request(sock, server).await;

    let mut received = Vec::new();
    let mut expected = 1u16;
    loop {
        let data = Data::decode(&recv(sock).await).unwrap();
        assert_eq!(data.block, expected);
        received.extend_from_slice(&data.payload);
        ack(sock, server, data.block).await;

        if data.payload.len() < BLOCK_SIZE {
            return (received, data.block);
        }
        expected += 1;
    }
}

async fn wait_for_no_sessions(server: &Server) {
    for _ in 0..100 {
        if server.active_sessions() == 0 {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("{} sessions still active", server.active_sessions());
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A source whose every file is missing.
struct Missing;

impl FileSource for Missing {
    fn open(&self, _filename: &str) -> io::Result<Payload> {
        Err(io::Error::from(io::ErrorKind::NotFound))
    }
}

#[tokio::test]
async fn serves_multi_block_payload() {
    let payload = pattern(1300);
    let running = start(payload.clone(), 1000, 5).await;
    let sock = client().await;

    let (received, last_block) = download(&sock, running.addr).await;
    assert_eq!(received, payload);
    assert_eq!(last_block, 3);

    wait_for_no_sessions(&running.server).await;
}

#[tokio::test]
async fn empty_payload_is_one_empty_block() {
    let running = start(Vec::new(), 1000, 5).await;
    let sock = client().await;

    let (received, last_block) = download(&sock, running.addr).await;
    assert!(received.is_empty());
    assert_eq!(last_block, 1);
}

#[tokio::test]
async fn exact_multiple_gets_trailing_empty_block() {
    let payload = pattern(2 * BLOCK_SIZE);
    let running = start(payload.clone(), 1000, 5).await;
    let sock = client().await;

    let (received, last_block) = download(&sock, running.addr).await;
    assert_eq!(received, payload);
    assert_eq!(last_block, 3);
}

#[tokio::test]
async fn retransmits_then_gives_up_silently() {
    let running = start(pattern(100), 50, 2).await;
    let sock = client().await;
    request(&sock, running.addr).await;

    let first = recv(&sock).await;
    assert_eq!(Data::decode(&first).unwrap().block, 1);
    assert_eq!(recv(&sock).await, first);
    assert_eq!(recv(&sock).await, first);

    expect_silence(&sock, Duration::from_millis(300)).await;
    wait_for_no_sessions(&running.server).await;
}

#[tokio::test]
async fn duplicate_ack_sends_nothing() {
    let payload = pattern(1000);
    let running = start(payload.clone(), 1000, 5).await;
    let sock = client().await;
    request(&sock, running.addr).await;

    assert_eq!(Data::decode(&recv(&sock).await).unwrap().block, 1);
    ack(&sock, running.addr, 1).await;
    let second = Data::decode(&recv(&sock).await).unwrap();
    assert_eq!(second.block, 2);

    ack(&sock, running.addr, 1).await;
    expect_silence(&sock, Duration::from_millis(200)).await;

    ack(&sock, running.addr, 2).await;
    wait_for_no_sessions(&running.server).await;
    assert_eq!(second.payload, payload[BLOCK_SIZE..]);
}

#[tokio::test]
async fn illegal_packet_aborts_only_that_session() {
    let payload = pattern(1500);
    let running = start(payload.clone(), 1000, 5).await;
    let rogue = client().await;
    let polite = client().await;

    request(&rogue, running.addr).await;
    request(&polite, running.addr).await;
    assert_eq!(Data::decode(&recv(&rogue).await).unwrap().block, 1);
    assert_eq!(Data::decode(&recv(&polite).await).unwrap().block, 1);

    let bogus = Data { block: 1, payload: b"hi".to_vec() }.encode();
    rogue.send_to(&bogus, running.addr).await.unwrap();
    let reply = ErrorPacket::decode(&recv(&rogue).await).unwrap();
    assert_eq!(reply.code, ErrCode::IllegalOperation);

    // the other transfer carries on from block 1
    let mut received = Vec::new();
    let mut block = 1u16;
    let mut data = payload[..BLOCK_SIZE].to_vec();
    loop {
        received.extend_from_slice(&data);
        ack(&polite, running.addr, block).await;
        if data.len() < BLOCK_SIZE {
            break;
        }
        let next = Data::decode(&recv(&polite).await).unwrap();
        block += 1;
        assert_eq!(next.block, block);
        data = next.payload;
    }
    assert_eq!(received, payload);
    wait_for_no_sessions(&running.server).await;
}

#[tokio::test]
async fn concurrent_clients_have_independent_sessions() {
    let payload = pattern(3000);
    let running = start(payload.clone(), 1000, 5).await;
    let (a, b) = (client().await, client().await);

    let ((got_a, last_a), (got_b, last_b)) =
        tokio::join!(download(&a, running.addr), download(&b, running.addr));

    assert_eq!(got_a, payload);
    assert_eq!(got_b, payload);
    assert_eq!(last_a, 6);
    assert_eq!(last_b, 6);
}

#[tokio::test]
async fn repeated_final_ack_is_not_answered() {
    let running = start(pattern(10), 1000, 5).await;
    let sock = client().await;

    let (received, last_block) = download(&sock, running.addr).await;
    assert_eq!(received, pattern(10));
    wait_for_no_sessions(&running.server).await;

    // our last ACK got lost, as far as we know
    ack(&sock, running.addr, last_block).await;
    expect_silence(&sock, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn missing_file_is_reported_to_the_client() {
    let running = start_with(Missing, 1000, 5).await;
    let sock = client().await;
    request(&sock, running.addr).await;

    let reply = ErrorPacket::decode(&recv(&sock).await).unwrap();
    assert_eq!(reply.code, ErrCode::FileNotFound);
    wait_for_no_sessions(&running.server).await;
}

#[tokio::test]
async fn unknown_sender_gets_illegal_operation() {
    let running = start(pattern(10), 1000, 5).await;
    let sock = client().await;

    let stray = Data { block: 1, payload: b"hi".to_vec() }.encode();
    sock.send_to(&stray, running.addr).await.unwrap();
    let reply = ErrorPacket::decode(&recv(&sock).await).unwrap();
    assert_eq!(reply.code, ErrCode::IllegalOperation);
    assert_eq!(running.server.active_sessions(), 0);
}

#[tokio::test]
async fn error_from_unknown_sender_is_not_answered() {
    let running = start(pattern(10), 1000, 5).await;
    let sock = client().await;

    let err = ErrorPacket::new(ErrCode::Undefined, "bye").encode();
    sock.send_to(&err, running.addr).await.unwrap();
    expect_silence(&sock, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn rejects_non_octet_modes() {
    let running = start(pattern(10), 1000, 5).await;
    let sock = client().await;

    let rrq = ReadRequest::new("payload.svg", "netascii").encode();
    sock.send_to(&rrq, running.addr).await.unwrap();

    let reply = ErrorPacket::decode(&recv(&sock).await).unwrap();
    assert_eq!(reply.code, ErrCode::IllegalOperation);
    assert_eq!(running.server.active_sessions(), 0);
}

#[tokio::test]
async fn rejects_write_requests() {
    let running = start(pattern(10), 1000, 5).await;
    let sock = client().await;

    sock.send_to(b"\x00\x02upload.bin\x00octet\x00", running.addr)
        .await
        .unwrap();

    let reply = ErrorPacket::decode(&recv(&sock).await).unwrap();
    assert_eq!(reply.code, ErrCode::IllegalOperation);
}

#[tokio::test]
async fn shutdown_stops_serve_and_sessions() {
    let running = start(pattern(100), 100, 5).await;
    let sock = client().await;
    request(&sock, running.addr).await;
    recv(&sock).await;
    assert_eq!(running.server.active_sessions(), 1);

    running.server.shutdown();

    let result = timeout(PATIENCE, running.task).await.expect("serve did not return");
    assert!(result.unwrap().is_ok());
    assert_eq!(running.server.active_sessions(), 0);

    // the session timer is gone: no retransmission
    expect_silence(&sock, Duration::from_millis(300)).await;

    // and the port is free again
    UdpSocket::bind(running.addr).await.expect("listening socket still held");
}

#[tokio::test]
async fn bind_failure_is_reported() {
    let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = Config {
        listen: taken.local_addr().unwrap(),
        ..Config::default()
    };

    assert!(Server::bind(config, StaticPayload::default()).await.is_err());
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let config = Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        block_size: BLOCK_SIZE * 2,
        ..Config::default()
    };

    assert!(Server::bind(config, StaticPayload::default()).await.is_err());
}
