//! Tunnel layer - reliable streams over an unreliable session
//!
//! Provides:
//! - Packet and frame encoding/decoding
//! - Selective-repeat pacers
//! - Stream id registry
//! - TCP ↔ stream bridging

mod frame;
mod multiplexer;
mod packet;
mod pacer;
mod stream;

pub use frame::{Frame, FRAME_HEADER_SIZE};
pub use multiplexer::Registry;
pub use packet::{Packet, PACKET_HEADER_SIZE};
pub use pacer::{RecvPacer, SendPacer, SeqHeap};
pub use stream::{bridge, StreamConfig, StreamLink, StreamStats};

use crate::protocol::ProtocolError;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Stream not found: {0}")]
    StreamNotFound(u64),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Queue full for {0}")]
    QueueFull(u64),

    #[error("Stream refused by peer: {0}")]
    Refused(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("No acknowledgement after {0} retransmit rounds")]
    RetransmitLimit(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
