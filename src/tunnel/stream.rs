//! Stream bridge: one TCP socket glued to one multiplexed stream
//!
//! Two tasks run per stream. The send task reads the socket, feeds the
//! [`SendPacer`] and retransmits until every frame is acknowledged before it
//! reads again. The receive task acknowledges each FWD frame, reorders them
//! through the [`RecvPacer`] and writes the result to the socket. ACK and
//! RECVFIN frames are relayed from the receive task to the send task.
//!
//! Either task ending closes the other: local EOF sends SENDFIN, a local
//! write error sends RECVFIN, and a SENDFIN or RECVFIN from the peer ends
//! the stream. SENDFIN is answered with RECVFIN and resent until then.

use super::{Frame, RecvPacer, SendPacer, TunnelError};
use crate::protocol::{Method, MAX_FRAME_PAYLOAD, MIN_WINDOW, QUEUE_CAPACITY, RETRANSMIT_INTERVAL};
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

/// Bytes read from the local socket per batch
const READ_BUFFER_SIZE: usize = MAX_FRAME_PAYLOAD * MIN_WINDOW as usize;

/// Reliability parameters for a stream
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Initial send window (frames)
    pub window: u64,
    /// Period between retransmission rounds
    pub retransmit_interval: Duration,
    /// Rounds without ACK progress before the stream is abandoned
    pub max_retransmits: u32,
    /// Capacity of per-stream queues
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            window: MIN_WINDOW,
            retransmit_interval: RETRANSMIT_INTERVAL,
            max_retransmits: 20,
            queue_capacity: QUEUE_CAPACITY,
        }
    }
}

/// The session side of an established stream
#[derive(Debug)]
pub struct StreamLink {
    /// Our stream id
    pub local_id: u64,
    /// The peer's stream id
    pub remote_id: u64,
    /// Session egress
    pub outbound: mpsc::Sender<Frame>,
    /// Frames the session routed to `local_id`
    pub inbound: mpsc::Receiver<Frame>,
}

/// Byte counters for a finished stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Bytes read from the socket and acknowledged or abandoned
    pub sent: u64,
    /// Bytes written to the socket
    pub received: u64,
}

/// Run a stream until both directions have finished.
///
/// `initial` is sent before anything read from `socket`.
pub async fn bridge<S>(
    socket: S,
    link: StreamLink,
    initial: Bytes,
    config: &StreamConfig,
) -> Result<StreamStats, TunnelError>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (reader, writer) = tokio::io::split(socket);
    let (sync_tx, sync_rx) = mpsc::channel(config.queue_capacity.max(1));
    let (done_tx, done_rx) = oneshot::channel();

    let StreamLink {
        local_id,
        remote_id,
        outbound,
        inbound,
    } = link;

    let sender = SendTask {
        reader,
        local_id,
        pacer: SendPacer::new(local_id, remote_id, config.window),
        outbound: outbound.clone(),
        sync: sync_rx,
        config,
    };
    let receiver = RecvTask {
        writer,
        pacer: RecvPacer::new(),
        local_id,
        remote_id,
        outbound,
        inbound,
        sync: sync_tx,
    };

    let send = async move {
        let result = sender.run(initial).await;
        drop(done_tx);
        result
    };

    let (sent, received) = tokio::join!(send, receiver.run(done_rx));
    let stats = StreamStats {
        sent: sent?,
        received: received?,
    };

    debug!(
        "Stream {} -> {} closed ({} bytes sent, {} bytes received)",
        local_id, remote_id, stats.sent, stats.received
    );
    Ok(stats)
}

struct SendTask<'a, R> {
    reader: R,
    local_id: u64,
    pacer: SendPacer,
    outbound: mpsc::Sender<Frame>,
    sync: mpsc::Receiver<Frame>,
    config: &'a StreamConfig,
}

enum ReadEvent {
    Data(usize),
    Eof,
    PeerFinished,
}

enum FlushOutcome {
    /// Every frame acknowledged on the first transmission
    Clean,
    /// Acknowledged after at least one retransmit round
    Retransmitted,
    PeerFinished,
}

impl<R: AsyncRead + Unpin> SendTask<'_, R> {
    async fn run(mut self, initial: Bytes) -> Result<u64, TunnelError> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut sent = initial.len() as u64;
        let mut eof = false;

        self.pacer.push(&initial);

        loop {
            if self.pacer.is_drained() {
                if eof {
                    self.finish().await?;
                    return Ok(sent);
                }

                match self.read(&mut buf).await {
                    ReadEvent::Data(n) => {
                        self.pacer.push(&buf[..n]);
                        sent += n as u64;
                    }
                    ReadEvent::Eof => eof = true,
                    ReadEvent::PeerFinished => return Ok(sent),
                }
                continue;
            }

            match self.flush().await? {
                FlushOutcome::Clean => self.pacer.scale_up(),
                FlushOutcome::Retransmitted => {}
                FlushOutcome::PeerFinished => return Ok(sent),
            }
        }
    }

    /// Read the next chunk, watching for the peer ending the stream
    async fn read(&mut self, buf: &mut [u8]) -> ReadEvent {
        loop {
            tokio::select! {
                result = self.reader.read(buf) => {
                    return match result {
                        Ok(0) => ReadEvent::Eof,
                        Ok(n) => ReadEvent::Data(n),
                        Err(e) => {
                            debug!("Stream {} read error: {}", self.local_id, e);
                            ReadEvent::Eof
                        }
                    };
                }
                frame = self.sync.recv() => match frame {
                    Some(frame) if frame.method == Method::RecvFin => return ReadEvent::PeerFinished,
                    Some(_) => {}
                    None => return ReadEvent::PeerFinished,
                },
            }
        }
    }

    /// Send everything buffered and wait until it is acknowledged
    async fn flush(&mut self) -> Result<FlushOutcome, TunnelError> {
        let interval = self.config.retransmit_interval;
        let mut deadline = Instant::now() + interval;
        let mut stalled_rounds = 0u32;
        let mut clean = true;

        while !self.pacer.is_drained() {
            for frame in self.pacer.pop_frames() {
                self.emit(frame).await?;
            }

            tokio::select! {
                frame = self.sync.recv() => match frame {
                    Some(frame) if frame.method == Method::Ack => {
                        if self.pacer.recv_ack(frame.seq) {
                            stalled_rounds = 0;
                            deadline = Instant::now() + interval;
                        }
                    }
                    Some(frame) if frame.method == Method::RecvFin => {
                        return Ok(FlushOutcome::PeerFinished);
                    }
                    Some(_) => {}
                    None => return Ok(FlushOutcome::PeerFinished),
                },
                _ = time::sleep_until(deadline) => {
                    stalled_rounds += 1;
                    if stalled_rounds > self.config.max_retransmits {
                        warn!(
                            "Stream {} abandoned after {} retransmit rounds",
                            self.local_id,
                            self.config.max_retransmits
                        );
                        self.emit(self.pacer.done()).await?;
                        return Err(TunnelError::RetransmitLimit(self.config.max_retransmits));
                    }

                    clean = false;
                    self.pacer.scale_down();
                    let frames = self.pacer.selective_repeat();
                    trace!("Retransmitting {} frames (window {})", frames.len(), self.pacer.window());
                    for frame in frames {
                        self.emit(frame).await?;
                    }
                    deadline = Instant::now() + interval;
                }
            }
        }

        Ok(if clean {
            FlushOutcome::Clean
        } else {
            FlushOutcome::Retransmitted
        })
    }

    /// Send SENDFIN until the peer answers with RECVFIN
    async fn finish(&mut self) -> Result<(), TunnelError> {
        let fin = self.pacer.done();

        for _ in 0..=self.config.max_retransmits {
            self.emit(fin.clone()).await?;

            let deadline = Instant::now() + self.config.retransmit_interval;
            loop {
                tokio::select! {
                    frame = self.sync.recv() => match frame {
                        Some(frame) if frame.method == Method::RecvFin => return Ok(()),
                        Some(_) => {}
                        None => return Ok(()),
                    },
                    _ = time::sleep_until(deadline) => break,
                }
            }
        }

        debug!("Stream {} SENDFIN never answered", self.local_id);
        Ok(())
    }

    async fn emit(&self, frame: Frame) -> Result<(), TunnelError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::StreamClosed)
    }
}

struct RecvTask<W> {
    writer: W,
    pacer: RecvPacer,
    local_id: u64,
    remote_id: u64,
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<Frame>,
    sync: mpsc::Sender<Frame>,
}

impl<W: AsyncWrite + Unpin> RecvTask<W> {
    async fn run(mut self, mut done: oneshot::Receiver<()>) -> Result<u64, TunnelError> {
        let mut received = 0u64;

        loop {
            let frame = tokio::select! {
                frame = self.inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = &mut done => break,
            };

            match frame.method {
                Method::Fwd => {
                    self.emit(Frame::ack(frame.seq, self.local_id, self.remote_id))
                        .await?;
                    self.pacer.push_frame(frame);

                    let data = self.pacer.drain_ready();
                    if data.is_empty() {
                        continue;
                    }
                    if let Err(e) = self.writer.write_all(&data).await {
                        debug!("Stream {} write error: {}", self.local_id, e);
                        self.emit(Frame::recv_fin(self.local_id, self.remote_id))
                            .await?;
                        break;
                    }
                    received += data.len() as u64;
                }
                Method::Ack | Method::RecvFin => {
                    let finished = frame.method == Method::RecvFin;
                    // The send task may already be gone
                    let _ = self.sync.send(frame).await;
                    if finished {
                        break;
                    }
                }
                Method::SendFin => {
                    trace!("Stream {} peer finished at seq {}", self.local_id, frame.seq);
                    self.emit(Frame::recv_fin(self.local_id, self.remote_id))
                        .await?;
                    break;
                }
                other => {
                    trace!("Stream {} ignoring {}", self.local_id, other);
                }
            }
        }

        let _ = self.writer.shutdown().await;
        Ok(received)
    }

    async fn emit(&self, frame: Frame) -> Result<(), TunnelError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::StreamClosed)
    }
}
