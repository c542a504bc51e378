//! Session packet envelope
//!
//! Packet format (big endian), always carried inside an obfuscated datagram:
//! ```text
//! +--------+--------+--------+--------+
//! |      Connection id (8B)           |
//! +--------+--------+--------+--------+
//! | Method |      Created (8B)        |
//! +--------+--------+--------+--------+
//! |         Sequence (8B)             |
//! +--------+--------+--------+--------+
//! |         Source (8B)               |
//! +--------+--------+--------+--------+
//! |         Destination (8B)          |
//! +--------+--------+--------+--------+
//! |        Payload length (4B)        |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```

use super::Frame;
use crate::crypto::{random_bytes, unix_now, CryptoError, KEY_LEN};
use crate::protocol::{Method, ProtocolError, INIT_PAYLOAD_SIZE, PACKET_FRESHNESS_SECS};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Packet header size in bytes
pub const PACKET_HEADER_SIZE: usize = 8 + 1 + 8 + 8 + 8 + 8 + 4;

/// A session-level packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Connection id assigned by the server (0 before AUTH)
    pub conn_id: u64,
    /// Method code
    pub method: Method,
    /// Creation time (Unix secs)
    pub created: u64,
    /// Sequence number
    pub seq: u64,
    /// Source stream id
    pub src: u64,
    /// Destination stream id
    pub dst: u64,
    /// Payload data
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet stamped with the current time
    pub fn new(conn_id: u64, method: Method, seq: u64, src: u64, dst: u64, payload: Bytes) -> Self {
        Self {
            conn_id,
            method,
            created: unix_now(),
            seq,
            src,
            dst,
            payload,
        }
    }

    /// Client hello: the ephemeral key followed by random padding up to 1200 bytes
    pub fn init(pkey: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let mut payload = vec![0u8; INIT_PAYLOAD_SIZE];
        payload[..KEY_LEN].copy_from_slice(pkey);
        random_bytes(&mut payload[KEY_LEN..])?;

        Ok(Self::new(0, Method::Init, 0, 0, 0, Bytes::from(payload)))
    }

    /// Retry token carrier
    pub fn retry(token: &[u8]) -> Self {
        Self::new(0, Method::Retry, 0, 0, 0, Bytes::copy_from_slice(token))
    }

    /// Wrap a stream frame for session `conn_id`
    pub fn from_frame(conn_id: u64, frame: &Frame) -> Self {
        Self::new(
            conn_id,
            frame.method,
            frame.seq,
            frame.src,
            frame.dst,
            frame.payload.clone(),
        )
    }

    /// Strip the session envelope
    pub fn into_frame(self) -> Frame {
        Frame::new(self.method, self.seq, self.src, self.dst, self.payload)
    }

    /// Encode packet to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());

        buf.put_u64(self.conn_id);
        buf.put_u8(self.method as u8);
        buf.put_u64(self.created);
        buf.put_u64(self.seq);
        buf.put_u64(self.src);
        buf.put_u64(self.dst);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Decode a packet from a complete buffer
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                what: "packet header",
                needed: PACKET_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let conn_id = buf.get_u64();
        let method = Method::try_from(buf.get_u8())?;
        let created = buf.get_u64();
        let seq = buf.get_u64();
        let src = buf.get_u64();
        let dst = buf.get_u64();
        let payload_len = buf.get_u32() as usize;

        if buf.remaining() < payload_len {
            return Err(ProtocolError::Truncated {
                what: "packet payload",
                needed: payload_len,
                actual: buf.remaining(),
            });
        }

        Ok(Self {
            conn_id,
            method,
            created,
            seq,
            src,
            dst,
            payload: Bytes::copy_from_slice(&buf[..payload_len]),
        })
    }

    /// Check freshness and that every header field matches
    pub fn validate(
        &self,
        conn_id: u64,
        method: Method,
        seq: u64,
        src: u64,
        dst: u64,
    ) -> Result<(), ProtocolError> {
        self.validate_at(conn_id, method, seq, src, dst, unix_now())
    }

    /// [`Packet::validate`] against an explicit current time
    pub fn validate_at(
        &self,
        conn_id: u64,
        method: Method,
        seq: u64,
        src: u64,
        dst: u64,
        now: u64,
    ) -> Result<(), ProtocolError> {
        check("conn_id", conn_id, self.conn_id)?;
        check("method", method as u64, self.method as u64)?;

        if now.saturating_sub(self.created) > PACKET_FRESHNESS_SECS
            || self.created.saturating_sub(now) > PACKET_FRESHNESS_SECS
        {
            return Err(ProtocolError::Expired {
                created: self.created,
                now,
            });
        }

        check("seq", seq, self.seq)?;
        check("src", src, self.src)?;
        check("dst", dst, self.dst)
    }
}

fn check(field: &'static str, expected: u64, actual: u64) -> Result<(), ProtocolError> {
    if expected != actual {
        return Err(ProtocolError::Mismatch {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}
