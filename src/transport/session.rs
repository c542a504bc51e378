//! Established-session plumbing
//!
//! After the handshake both sides speak [`Frame`]s wrapped in packets
//! sealed under the session key. Egress is one task per session draining a
//! bounded queue; ingress decodes each datagram and routes the frame to the
//! stream named by its `dst`.
//!
//! OK or FWD for a stream this side no longer has is answered with RECVFIN
//! so the peer releases its half. A RECVFIN with `dst` 0 cancels the stream
//! the server opened for the CONN with that `src`, for when the OK never
//! reached the client.

use super::handshake::{open, seal};
use super::{Established, SharedDatagram, TransportConfig, TransportError};
use crate::obfuscation::Obfuscator;
use crate::protocol::Method;
use crate::tunnel::{bridge, Frame, Packet, Registry, StreamLink, TunnelError};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

/// Spawn the egress task for a session and return its queue
pub(crate) fn spawn_egress(
    socket: SharedDatagram,
    peer: SocketAddr,
    conn_id: u64,
    obfuscator: Arc<Obfuscator>,
    capacity: usize,
) -> mpsc::Sender<Frame> {
    let (tx, mut rx) = mpsc::channel::<Frame>(capacity.max(1));

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let packet = Packet::from_frame(conn_id, &frame);
            let datagram = match seal(&obfuscator, &packet) {
                Ok(datagram) => datagram,
                Err(e) => {
                    warn!("Failed to seal {} for {}: {}", frame.method, peer, e);
                    continue;
                }
            };

            if let Err(e) = socket.send_to(&datagram, peer).await {
                debug!("UDP send to {} failed: {}", peer, e);
            }
        }
        trace!("Egress for session {} finished", conn_id);
    });

    tx
}

/// Decode a session datagram, checking the connection id and freshness
pub(crate) fn open_frame(
    obfuscator: &Obfuscator,
    conn_id: u64,
    data: &[u8],
) -> Result<Frame, TransportError> {
    let packet = open(obfuscator, data)?;
    packet.validate(conn_id, packet.method, packet.seq, packet.src, packet.dst)?;
    Ok(packet.into_frame())
}

/// Deliver a frame to its stream. Undeliverable frames are dropped.
pub(crate) async fn route(
    streams: &Registry<Frame>,
    outbound: &mpsc::Sender<Frame>,
    frame: Frame,
    timeout: Duration,
) {
    let (method, src, dst) = (frame.method, frame.src, frame.dst);
    match streams.dispatch(dst, frame, timeout).await {
        Ok(()) => {}
        Err(TunnelError::StreamNotFound(_)) if matches!(method, Method::Ok | Method::Fwd) => {
            debug!("{} for closed stream {}, closing remote stream {}", method, dst, src);
            let _ = outbound.send(Frame::recv_fin(dst, src)).await;
        }
        Err(e) => debug!("Dropping {} for stream {}: {}", method, dst, e),
    }
}

/// Server side of an established session
pub(crate) struct ServerSession {
    conn_id: u64,
    peer: SocketAddr,
    obfuscator: Arc<Obfuscator>,
    streams: Arc<Registry<Frame>>,
    outbound: mpsc::Sender<Frame>,
    config: Arc<TransportConfig>,
    /// Client stream id → our stream id, for CONN cancellation
    accepted: HashMap<u64, u64>,
}

impl ServerSession {
    pub(crate) fn new(
        socket: SharedDatagram,
        peer: SocketAddr,
        established: &Established,
        streams: Arc<Registry<Frame>>,
        config: Arc<TransportConfig>,
    ) -> Result<Self, TransportError> {
        let obfuscator = Arc::new(Obfuscator::new(config.protocol, &established.key)?);
        let outbound = spawn_egress(
            socket,
            peer,
            established.conn_id,
            obfuscator.clone(),
            config.queue_capacity,
        );

        Ok(Self {
            conn_id: established.conn_id,
            peer,
            obfuscator,
            streams,
            outbound,
            config,
            accepted: HashMap::new(),
        })
    }

    /// Serve datagrams from `inbox` until FIN, idle expiry, or the inbox closes
    pub(crate) async fn run(mut self, inbox: &mut mpsc::Receiver<Bytes>) {
        let idle = self.config.idle_timeout;
        let mut deadline = Instant::now() + idle;

        loop {
            let data = tokio::select! {
                data = inbox.recv() => match data {
                    Some(data) => data,
                    None => break,
                },
                _ = time::sleep_until(deadline) => {
                    info!("Session {} idle for {:?}, closing", self.conn_id, idle);
                    break;
                }
            };

            let frame = match open_frame(&self.obfuscator, self.conn_id, &data) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Dropping datagram from {}: {}", self.peer, e);
                    continue;
                }
            };
            deadline = Instant::now() + idle;

            match frame.method {
                Method::Conn => self.accept_stream(frame).await,
                Method::Ping => {
                    let _ = self.outbound.send(Frame::pong()).await;
                }
                Method::Pong => {}
                Method::Fin => {
                    info!("Session {} closed by {}", self.conn_id, self.peer);
                    break;
                }
                Method::RecvFin if frame.dst == 0 => self.cancel_stream(frame.src).await,
                _ => {
                    route(
                        &self.streams,
                        &self.outbound,
                        frame,
                        self.config.dispatch_timeout,
                    )
                    .await
                }
            }
        }

        self.streams.clear().await;
    }

    async fn accept_stream(&mut self, request: Frame) {
        let live = self.streams.ids().await;
        self.accepted.retain(|_, local_id| live.contains(local_id));

        let (local_id, inbound) = self.streams.create().await;
        self.accepted.insert(request.src, local_id);
        let host = String::from_utf8_lossy(&request.payload).into_owned();
        debug!(
            "Session {} stream {} -> {} requested by remote stream {}",
            self.conn_id, local_id, host, request.src
        );

        tokio::spawn(connect_target(
            host,
            StreamLink {
                local_id,
                remote_id: request.src,
                outbound: self.outbound.clone(),
                inbound,
            },
            self.streams.clone(),
            self.config.clone(),
        ));
    }

    /// The client stopped waiting for OK on its stream `remote_id`
    async fn cancel_stream(&mut self, remote_id: u64) {
        let Some(local_id) = self.accepted.remove(&remote_id) else {
            trace!("Cancel for unknown remote stream {}", remote_id);
            return;
        };

        debug!(
            "Session {} stream {} cancelled by remote stream {}",
            self.conn_id, local_id, remote_id
        );
        route(
            &self.streams,
            &self.outbound,
            Frame::recv_fin(remote_id, local_id),
            self.config.dispatch_timeout,
        )
        .await;
    }
}

/// Dial the CONN target and bridge it to the stream
async fn connect_target(
    host: String,
    link: StreamLink,
    streams: Arc<Registry<Frame>>,
    config: Arc<TransportConfig>,
) {
    let local_id = link.local_id;

    let socket = match time::timeout(config.connect_timeout, TcpStream::connect(&host)).await {
        Ok(Ok(socket)) => Some(socket),
        Ok(Err(e)) => {
            warn!("Failed to connect to {}: {}", host, e);
            None
        }
        Err(_) => {
            warn!("Timed out connecting to {}", host);
            None
        }
    };

    let Some(socket) = socket else {
        let _ = link.outbound.send(Frame::err(link.remote_id)).await;
        streams.delete(local_id).await;
        return;
    };

    if let Err(e) = socket.set_nodelay(true) {
        trace!("set_nodelay failed for {}: {}", host, e);
    }

    if link
        .outbound
        .send(Frame::ok(local_id, link.remote_id))
        .await
        .is_err()
    {
        streams.delete(local_id).await;
        return;
    }
    info!("Stream {} connected to {}", local_id, host);

    match bridge(socket, link, Bytes::new(), &config.stream).await {
        Ok(stats) => debug!(
            "Stream {} to {} finished ({} up, {} down)",
            local_id, host, stats.received, stats.sent
        ),
        Err(e) => debug!("Stream {} to {} ended: {}", local_id, host, e),
    }

    streams.delete(local_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obfuscation::ObfuscatorKind;
    use crate::protocol::ProtocolError;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn obfuscator() -> Obfuscator {
        Obfuscator::new(ObfuscatorKind::Basic, &[0x33u8; 32]).unwrap()
    }

    #[test]
    fn test_open_frame_checks_session() {
        let obfuscator = obfuscator();
        let frame = Frame::fwd(4, 1, 2, Bytes::from_static(b"data"));
        let datagram = seal(&obfuscator, &Packet::from_frame(77, &frame)).unwrap();

        let opened = open_frame(&obfuscator, 77, &datagram).unwrap();
        assert_eq!(opened, frame);

        let result = open_frame(&obfuscator, 78, &datagram);
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::Mismatch { field: "conn_id", .. }))
        ));
    }

    #[test]
    fn test_open_frame_rejects_stale_datagram() {
        let obfuscator = obfuscator();
        let mut packet = Packet::from_frame(77, &Frame::ping());
        packet.created -= 10;
        let datagram = seal(&obfuscator, &packet).unwrap();

        let result = open_frame(&obfuscator, 77, &datagram);
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::Expired { .. }))
        ));
    }

    #[test]
    fn test_open_frame_rejects_tampered_datagram() {
        let obfuscator = obfuscator();
        let mut datagram = seal(&obfuscator, &Packet::from_frame(77, &Frame::ping())).unwrap();
        let last = datagram.len() - 1;
        datagram[last] ^= 0x01;

        assert!(open_frame(&obfuscator, 77, &datagram).is_err());
        assert!(open_frame(&obfuscator, 77, b"not a datagram").is_err());
    }

    #[tokio::test]
    async fn test_route_delivers_to_stream() {
        let streams = Registry::new(8);
        let (id, mut inbound) = streams.create().await;
        let (tx, mut rx) = mpsc::channel(8);

        route(&streams, &tx, Frame::ack(3, 9, id), TIMEOUT).await;

        assert_eq!(inbound.recv().await.unwrap(), Frame::ack(3, 9, id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_closes_remote_of_unknown_stream() {
        let streams = Registry::new(8);
        let (tx, mut rx) = mpsc::channel(8);

        // A late OK for a stream that already gave up
        route(&streams, &tx, Frame::ok(12, 5), TIMEOUT).await;
        assert_eq!(rx.try_recv().unwrap(), Frame::recv_fin(5, 12));

        route(&streams, &tx, Frame::fwd(0, 12, 6, Bytes::from_static(b"x")), TIMEOUT).await;
        assert_eq!(rx.try_recv().unwrap(), Frame::recv_fin(6, 12));
    }

    #[tokio::test]
    async fn test_route_drops_closing_frames_silently() {
        let streams = Registry::new(8);
        let (tx, mut rx) = mpsc::channel(8);

        route(&streams, &tx, Frame::ack(1, 12, 5), TIMEOUT).await;
        route(&streams, &tx, Frame::send_fin(1, 12, 5), TIMEOUT).await;
        route(&streams, &tx, Frame::recv_fin(12, 5), TIMEOUT).await;
        route(&streams, &tx, Frame::err(5), TIMEOUT).await;

        assert!(rx.try_recv().is_err());
    }
}
