//! Integration tests for Drill
//!
//! Runs a server, a client session and the HTTP CONNECT front end on
//! loopback against a local TCP target.

use async_trait::async_trait;
use drill::proxy::HttpProxyServer;
use drill::transport::{Datagram, TransportError};
use drill::tunnel::TunnelError;
use drill::{Client, Server, TransportConfig};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

fn test_config(secret: [u8; 32]) -> TransportConfig {
    let mut config = TransportConfig::new(secret);
    config.handshake_timeout = Duration::from_millis(500);
    config.connect_timeout = Duration::from_secs(2);
    config.stream.retransmit_interval = Duration::from_millis(50);
    config.stream.max_retransmits = 100;
    config
}

async fn start_server(secret: [u8; 32]) -> (Server, SocketAddr) {
    start_server_with(test_config(secret)).await
}

async fn start_server_with(config: TransportConfig) -> (Server, SocketAddr) {
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let running = server.clone();
    tokio::spawn(async move { running.run().await });

    (server, addr)
}

/// Start the client session and its HTTP front end
async fn start_proxy(client: &Client) -> SocketAddr {
    let proxy = HttpProxyServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = proxy.local_addr().unwrap();

    let session = client.clone();
    tokio::spawn(async move { session.run().await });

    let front = client.clone();
    tokio::spawn(async move { proxy.run(&front).await });

    addr
}

/// TCP target that collects everything it receives until EOF
async fn collecting_target() -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        received
    });

    (addr, handle)
}

async fn connect_through(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target).as_bytes())
        .await
        .unwrap();

    let mut reply = vec![0u8; ESTABLISHED.len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, ESTABLISHED);

    stream
}

async fn wait_for_streams(server: &Server, expected: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while server.stream_count().await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("server stream count did not settle");
}

async fn wait_for_sessions(server: &Server, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.session_count().await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("server session count did not settle");
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn test_handshake_success() {
    let secret = [0x42u8; 32];
    let (server, addr) = start_server(secret).await;

    let client = Client::connect(addr, test_config(secret)).await.unwrap();
    assert_ne!(client.conn_id(), 0);
    assert_eq!(server.session_count().await, 1);

    let second = Client::connect(addr, test_config(secret)).await.unwrap();
    assert_ne!(second.conn_id(), client.conn_id());
    assert_eq!(server.session_count().await, 2);
}

#[tokio::test]
async fn test_handshake_wrong_secret() {
    let (server, addr) = start_server([1u8; 32]).await;

    let result = Client::connect(addr, test_config([2u8; 32])).await;
    assert!(matches!(result, Err(TransportError::HandshakeTimeout(_))));

    // The failed attempt leaves no session behind
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.session_count().await, 0);
}

#[tokio::test]
async fn test_connect_upload() {
    let secret = [7u8; 32];
    let (server, addr) = start_server(secret).await;
    let client = Client::connect(addr, test_config(secret)).await.unwrap();
    let proxy = start_proxy(&client).await;
    let (target, received) = collecting_target().await;

    let data = payload(5000);
    let mut stream = connect_through(proxy, target).await;
    stream.write_all(&data).await.unwrap();
    stream.shutdown().await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), received)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, data);

    drop(stream);
    wait_for_streams(&server, 0).await;
}

#[tokio::test]
async fn test_connect_download() {
    let secret = [8u8; 32];
    let (server, addr) = start_server(secret).await;
    let client = Client::connect(addr, test_config(secret)).await.unwrap();
    let proxy = start_proxy(&client).await;

    let data = payload(20_000);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    let sent = data.clone();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&sent).await.unwrap();
    });

    let mut stream = connect_through(proxy, target).await;
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, data);

    wait_for_streams(&server, 0).await;
}

#[tokio::test]
async fn test_pipelined_bytes_forwarded() {
    let secret = [9u8; 32];
    let (_server, addr) = start_server(secret).await;
    let client = Client::connect(addr, test_config(secret)).await.unwrap();
    let proxy = start_proxy(&client).await;
    let (target, received) = collecting_target().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\nhello tunnel", target).as_bytes())
        .await
        .unwrap();

    let mut reply = vec![0u8; ESTABLISHED.len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, ESTABLISHED);
    stream.shutdown().await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), received)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"hello tunnel");
}

#[tokio::test]
async fn test_unreachable_target() {
    let secret = [3u8; 32];
    let (server, addr) = start_server(secret).await;
    let client = Client::connect(addr, test_config(secret)).await.unwrap();
    let proxy = start_proxy(&client).await;

    // Reserve a port, then close it so the dial is refused
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = closed.local_addr().unwrap();
    drop(closed);

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
        .await
        .unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, BAD_GATEWAY);

    wait_for_streams(&server, 0).await;
    assert_eq!(client.stream_count().await, 0);
}

#[tokio::test]
async fn test_non_connect_rejected() {
    let secret = [4u8; 32];
    let (_server, addr) = start_server(secret).await;
    let client = Client::connect(addr, test_config(secret)).await.unwrap();
    let proxy = start_proxy(&client).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert!(reply.starts_with(b"HTTP/1.1 405"));
}

#[tokio::test]
async fn test_client_shutdown_closes_session() {
    let secret = [5u8; 32];
    let (server, addr) = start_server(secret).await;
    let client = Client::connect(addr, test_config(secret)).await.unwrap();

    let session = client.clone();
    let running = tokio::spawn(async move { session.run().await });

    assert_eq!(server.session_count().await, 1);
    client.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    tokio::time::timeout(Duration::from_secs(2), async {
        while server.session_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_client_idle_expiry() {
    let secret = [6u8; 32];
    let (_server, addr) = start_server(secret).await;

    let mut config = test_config(secret);
    // Keepalive slower than expiry, so the session goes quiet
    config.keepalive_interval = Duration::from_secs(60);
    config.idle_timeout = Duration::from_millis(300);
    let client = Client::connect(addr, config).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), client.run())
        .await
        .unwrap();
    assert!(matches!(result, Err(TransportError::SessionExpired(_))));
}

/// Drops every `every`th datagram sent after the first `skip`
struct LossySocket {
    inner: UdpSocket,
    sent: AtomicUsize,
    skip: usize,
    every: usize,
}

#[async_trait]
impl Datagram for LossySocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed);
        if n >= self.skip && (n - self.skip) % self.every == self.every - 1 {
            return Ok(buf.len());
        }
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[tokio::test]
async fn test_transfer_over_lossy_link() {
    let secret = [0x5au8; 32];
    let (server, addr) = start_server(secret).await;

    let socket = LossySocket {
        inner: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        sent: AtomicUsize::new(0),
        // INIT, RETRY echo and OK go through untouched
        skip: 3,
        every: 4,
    };
    let client = Client::handshake(Arc::new(socket), addr, test_config(secret))
        .await
        .unwrap();
    let proxy = start_proxy(&client).await;
    let (target, received) = collecting_target().await;

    let data = payload(50_000);
    let mut stream = connect_through(proxy, target).await;
    stream.write_all(&data).await.unwrap();
    stream.shutdown().await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(20), received)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), data.len());
    assert_eq!(received, data);

    drop(stream);
    wait_for_streams(&server, 0).await;
}

#[tokio::test]
async fn test_server_idle_expiry() {
    let secret = [0x11u8; 32];
    let mut server_config = test_config(secret);
    server_config.idle_timeout = Duration::from_millis(300);
    let (server, addr) = start_server_with(server_config).await;

    let mut config = test_config(secret);
    config.keepalive_interval = Duration::from_secs(60);
    let _client = Client::connect(addr, config).await.unwrap();
    assert_eq!(server.session_count().await, 1);

    // The client never runs, so nothing reaches the server after OK
    wait_for_sessions(&server, 0).await;
}

#[tokio::test]
async fn test_keepalive_holds_idle_session() {
    let secret = [0x12u8; 32];
    let mut config = test_config(secret);
    config.keepalive_interval = Duration::from_millis(100);
    config.idle_timeout = Duration::from_millis(400);
    let (server, addr) = start_server_with(config.clone()).await;
    let client = Client::connect(addr, config).await.unwrap();

    // No streams, only PING/PONG, for several idle timeouts
    let result = tokio::time::timeout(Duration::from_millis(1500), client.run()).await;
    assert!(result.is_err(), "session ended: {:?}", result);
    assert_eq!(server.session_count().await, 1);
}

/// Remembers the last datagram sent
struct TapSocket {
    inner: UdpSocket,
    last_sent: Mutex<Vec<u8>>,
}

impl TapSocket {
    fn last_sent(&self) -> Vec<u8> {
        self.last_sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Datagram for TapSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        *self.last_sent.lock().unwrap() = buf.to_vec();
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[tokio::test]
async fn test_forged_datagrams_leave_session_intact() {
    let secret = [0x13u8; 32];
    let (server, addr) = start_server(secret).await;

    let socket = Arc::new(TapSocket {
        inner: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        last_sent: Mutex::new(Vec::new()),
    });
    let client = Client::handshake(socket.clone(), addr, test_config(secret))
        .await
        .unwrap();
    let proxy = start_proxy(&client).await;
    assert_eq!(server.session_count().await, 1);

    // Same source address as the session, so these reach its queue
    let mut flipped = socket.last_sent();
    assert!(!flipped.is_empty());
    let last = flipped.len() - 1;
    flipped[last] ^= 0x01;
    socket.inner.send_to(&flipped, addr).await.unwrap();
    socket.inner.send_to(b"garbage", addr).await.unwrap();
    socket.inner.send_to(&[0xa5u8; 1300], addr).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.session_count().await, 1);

    let (target, received) = collecting_target().await;
    let data = payload(8000);
    let mut stream = connect_through(proxy, target).await;
    stream.write_all(&data).await.unwrap();
    stream.shutdown().await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), received)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, data);
    assert_eq!(server.session_count().await, 1);
}

/// Loses the first datagram received once armed
struct DeafSocket {
    inner: UdpSocket,
    armed: AtomicBool,
}

#[async_trait]
impl Datagram for DeafSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let received = self.inner.recv_from(buf).await?;
            if !self.armed.swap(false, Ordering::SeqCst) {
                return Ok(received);
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[tokio::test]
async fn test_lost_ok_releases_server_stream() {
    let secret = [0x14u8; 32];
    let (server, addr) = start_server(secret).await;

    let socket = Arc::new(DeafSocket {
        inner: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        armed: AtomicBool::new(false),
    });
    let mut config = test_config(secret);
    config.connect_timeout = Duration::from_millis(500);
    let client = Client::handshake(socket.clone(), addr, config).await.unwrap();

    let session = client.clone();
    tokio::spawn(async move { session.run().await });

    // Accepts, then never speaks or closes
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    socket.armed.store(true, Ordering::SeqCst);
    let result = client.open_stream(&target.to_string()).await;
    assert!(matches!(
        result,
        Err(TransportError::Tunnel(TunnelError::Timeout(_)))
    ));
    assert_eq!(client.stream_count().await, 0);

    wait_for_streams(&server, 0).await;
    assert_eq!(server.session_count().await, 1);
}
