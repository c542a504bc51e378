//! Client session
//!
//! A [`Client`] owns one handshaken session with the server. [`Client::run`]
//! drives ingress and keepalive; any number of tasks may open streams over
//! the session concurrently through cheap clones.

use super::handshake::{client_handshake, seal};
use super::session::{open_frame, route, spawn_egress};
use super::{SharedDatagram, TransportConfig, TransportError};
use crate::obfuscation::Obfuscator;
use crate::protocol::{Method, MAX_DATAGRAM_SIZE};
use crate::tunnel::{self, Frame, Packet, Registry, StreamLink, StreamStats, TunnelError};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

struct ClientInner {
    conn_id: u64,
    server: SocketAddr,
    socket: SharedDatagram,
    obfuscator: Arc<Obfuscator>,
    streams: Registry<Frame>,
    outbound: mpsc::Sender<Frame>,
    config: Arc<TransportConfig>,
    shutdown: Notify,
}

/// Handle to an established client session
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Bind an ephemeral UDP socket and handshake with `server`
    pub async fn connect(server: SocketAddr, config: TransportConfig) -> Result<Self, TransportError> {
        let unspecified = match server {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
        Self::handshake(Arc::new(socket), server, config).await
    }

    /// Handshake with `server` over an existing socket
    pub async fn handshake(
        socket: SharedDatagram,
        server: SocketAddr,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let established = client_handshake(&*socket, server, &config).await?;
        let obfuscator = Arc::new(Obfuscator::new(config.protocol, &established.key)?);
        let outbound = spawn_egress(
            socket.clone(),
            server,
            established.conn_id,
            obfuscator.clone(),
            config.queue_capacity,
        );
        info!("Session {} established with {}", established.conn_id, server);

        Ok(Self {
            inner: Arc::new(ClientInner {
                conn_id: established.conn_id,
                server,
                socket,
                obfuscator,
                streams: Registry::new(config.queue_capacity),
                outbound,
                config: Arc::new(config),
                shutdown: Notify::new(),
            }),
        })
    }

    /// Connection id assigned by the server
    pub fn conn_id(&self) -> u64 {
        self.inner.conn_id
    }

    /// Open streams
    pub async fn stream_count(&self) -> usize {
        self.inner.streams.len().await
    }

    /// Drive the session until shutdown, FIN from the server, or idle expiry
    pub async fn run(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        let idle = inner.config.idle_timeout;
        let interval = inner.config.keepalive_interval;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut deadline = Instant::now() + idle;
        let mut keepalive = time::interval_at(Instant::now() + interval, interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                received = inner.socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            debug!("UDP receive error: {}", e);
                            continue;
                        }
                    };
                    if from != inner.server {
                        trace!("Ignoring datagram from {}", from);
                        continue;
                    }

                    let frame = match open_frame(&inner.obfuscator, inner.conn_id, &buf[..n]) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!("Dropping datagram from {}: {}", from, e);
                            continue;
                        }
                    };
                    deadline = Instant::now() + idle;

                    match frame.method {
                        Method::Pong => trace!("PONG from {}", from),
                        Method::Fin => {
                            info!("Session {} closed by server", inner.conn_id);
                            break Err(TransportError::Closed);
                        }
                        _ => {
                            route(
                                &inner.streams,
                                &inner.outbound,
                                frame,
                                inner.config.dispatch_timeout,
                            )
                            .await
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if inner.outbound.send(Frame::ping()).await.is_err() {
                        break Err(TransportError::Closed);
                    }
                }
                _ = time::sleep_until(deadline) => {
                    break Err(TransportError::SessionExpired(idle));
                }
                _ = inner.shutdown.notified() => break Ok(()),
            }
        };

        inner.streams.clear().await;
        result
    }

    /// Send FIN and stop [`Client::run`]
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let fin = Packet::from_frame(inner.conn_id, &Frame::fin());

        match seal(&inner.obfuscator, &fin) {
            Ok(datagram) => {
                if let Err(e) = inner.socket.send_to(&datagram, inner.server).await {
                    debug!("Failed to send FIN: {}", e);
                }
            }
            Err(e) => debug!("Failed to seal FIN: {}", e),
        }
        inner.shutdown.notify_one();
    }

    /// Ask the server to connect to `host` and wait for OK or ERR
    pub async fn open_stream(&self, host: &str) -> Result<StreamLink, TransportError> {
        let inner = &self.inner;
        let (local_id, mut inbound) = inner.streams.create().await;

        if inner.outbound.send(Frame::conn(local_id, host)).await.is_err() {
            inner.streams.delete(local_id).await;
            return Err(TransportError::Closed);
        }

        let reply = time::timeout(inner.config.connect_timeout, async {
            while let Some(frame) = inbound.recv().await {
                match frame.method {
                    Method::Ok | Method::Err => return Some(frame),
                    other => trace!("Stream {} ignoring {} before OK", local_id, other),
                }
            }
            None
        })
        .await;

        let error = match reply {
            Ok(Some(frame)) if frame.method == Method::Ok => {
                debug!("Stream {} -> {} opened (remote {})", local_id, host, frame.src);
                return Ok(StreamLink {
                    local_id,
                    remote_id: frame.src,
                    outbound: inner.outbound.clone(),
                    inbound,
                });
            }
            Ok(Some(_)) => TunnelError::Refused(host.to_string()),
            Ok(None) => TunnelError::StreamClosed,
            Err(_) => {
                // dst 0: release whatever the server accepted for our CONN
                let _ = inner.outbound.send(Frame::recv_fin(local_id, 0)).await;
                TunnelError::Timeout("stream OK")
            }
        };

        inner.streams.delete(local_id).await;
        Err(error.into())
    }

    /// Bridge `socket` to an opened stream, then release the stream
    pub async fn bridge<S>(
        &self,
        socket: S,
        link: StreamLink,
        initial: Bytes,
    ) -> Result<StreamStats, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let local_id = link.local_id;
        let result = tunnel::bridge(socket, link, initial, &self.inner.config.stream).await;
        self.inner.streams.delete(local_id).await;
        Ok(result?)
    }
}
