//! Protocol definitions and constants

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Truncated {what}: need {needed} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("Unknown method: {0}")]
    UnknownMethod(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Packet expired: created {created}, now {now}")]
    Expired { created: u64, now: u64 },

    #[error("Field mismatch on {field}: expected {expected}, got {actual}")]
    Mismatch {
        field: &'static str,
        expected: u64,
        actual: u64,
    },
}

/// Packet / frame method codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    /// Client hello carrying the ephemeral key, padded to 1200 bytes
    Init = 0,
    /// Server retry token, echoed back by the client
    Retry = 1,
    /// Session key delivery
    Auth = 2,
    /// Session keepalive
    Ping = 3,
    /// Keepalive response
    Pong = 4,
    /// Session teardown
    Fin = 5,
    /// Open a stream to the host in the payload
    Conn = 6,
    /// Stream data
    Fwd = 7,
    /// Stream data acknowledgement
    Ack = 8,
    /// Sender finished (local socket EOF or read error)
    SendFin = 9,
    /// Receiver finished (local socket write error)
    RecvFin = 10,
    /// Success (handshake completion or stream opened)
    Ok = 11,
    /// Stream could not be opened
    Err = 12,
}

impl TryFrom<u8> for Method {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Method::Init),
            1 => Ok(Method::Retry),
            2 => Ok(Method::Auth),
            3 => Ok(Method::Ping),
            4 => Ok(Method::Pong),
            5 => Ok(Method::Fin),
            6 => Ok(Method::Conn),
            7 => Ok(Method::Fwd),
            8 => Ok(Method::Ack),
            9 => Ok(Method::SendFin),
            10 => Ok(Method::RecvFin),
            11 => Ok(Method::Ok),
            12 => Ok(Method::Err),
            _ => Err(ProtocolError::UnknownMethod(value)),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Init => "INIT",
            Method::Retry => "RETRY",
            Method::Auth => "AUTH",
            Method::Ping => "PING",
            Method::Pong => "PONG",
            Method::Fin => "FIN",
            Method::Conn => "CONN",
            Method::Fwd => "FWD",
            Method::Ack => "ACK",
            Method::SendFin => "SENDFIN",
            Method::RecvFin => "RECVFIN",
            Method::Ok => "OK",
            Method::Err => "ERR",
        };
        f.write_str(name)
    }
}

/// INIT payload size, and the minimum datagram a server accepts from an unknown peer
pub const INIT_PAYLOAD_SIZE: usize = 1200;

/// Maximum stream data carried by one FWD frame
pub const MAX_FRAME_PAYLOAD: usize = 1024;

/// Maximum UDP datagram we read
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Packet freshness window in seconds
pub const PACKET_FRESHNESS_SECS: u64 = 1;

/// Per-step handshake timeout
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Retransmission period for unacknowledged frames
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(300);

/// How long ingress dispatch waits on a full queue before dropping
pub const DISPATCH_TIMEOUT: Duration = Duration::from_millis(200);

/// Bounded queue capacity for inter-task channels
pub const QUEUE_CAPACITY: usize = 65535;

/// Send window bounds (frames)
pub const MIN_WINDOW: u64 = 32;
pub const MAX_WINDOW: u64 = 2048;

/// Idle timeout in seconds
pub const IDLE_TIMEOUT: u64 = 60;

/// Keepalive interval in seconds
pub const KEEPALIVE_INTERVAL: u64 = 15;
