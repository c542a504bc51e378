//! Frame encoding/decoding for logical streams
//!
//! Frame format (big endian):
//! ```text
//! +--------+--------+--------+--------+
//! | Method |      Sequence (8B)       |
//! +--------+--------+--------+--------+
//! |         Source stream (8B)        |
//! +--------+--------+--------+--------+
//! |       Destination stream (8B)     |
//! +--------+--------+--------+--------+
//! |        Payload length (4B)        |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```

use crate::protocol::{Method, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 1 + 8 + 8 + 8 + 4;

/// A stream-level message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Method code
    pub method: Method,
    /// Sequence number (FWD/ACK), zero for control frames
    pub seq: u64,
    /// Sender's stream id
    pub src: u64,
    /// Receiver's stream id (0 for session-level frames)
    pub dst: u64,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    pub fn new(method: Method, seq: u64, src: u64, dst: u64, payload: Bytes) -> Self {
        Self {
            method,
            seq,
            src,
            dst,
            payload,
        }
    }

    /// Open a stream to `host` ("example.com:443")
    pub fn conn(src: u64, host: &str) -> Self {
        Self::new(Method::Conn, 0, src, 0, Bytes::copy_from_slice(host.as_bytes()))
    }

    /// Stream opened; `src` is the responder's new stream id
    pub fn ok(src: u64, dst: u64) -> Self {
        Self::new(Method::Ok, 0, src, dst, Bytes::from_static(b"OK"))
    }

    /// Stream could not be opened
    pub fn err(dst: u64) -> Self {
        Self::new(Method::Err, 0, 0, dst, Bytes::from_static(b"ERR"))
    }

    /// Stream data
    pub fn fwd(seq: u64, src: u64, dst: u64, payload: Bytes) -> Self {
        Self::new(Method::Fwd, seq, src, dst, payload)
    }

    /// Acknowledge FWD `seq`
    pub fn ack(seq: u64, src: u64, dst: u64) -> Self {
        Self::new(Method::Ack, seq, src, dst, Bytes::from_static(b"ACK"))
    }

    /// Sender is done; `seq` is the first sequence never sent
    pub fn send_fin(seq: u64, src: u64, dst: u64) -> Self {
        Self::new(Method::SendFin, seq, src, dst, Bytes::from_static(b"SENDFIN"))
    }

    /// Receiver is done
    pub fn recv_fin(src: u64, dst: u64) -> Self {
        Self::new(Method::RecvFin, 0, src, dst, Bytes::from_static(b"RECVFIN"))
    }

    pub fn ping() -> Self {
        Self::new(Method::Ping, 0, 0, 0, Bytes::from_static(b"PING"))
    }

    pub fn pong() -> Self {
        Self::new(Method::Pong, 0, 0, 0, Bytes::from_static(b"PONG"))
    }

    /// Session teardown
    pub fn fin() -> Self {
        Self::new(Method::Fin, 0, 0, 0, Bytes::from_static(b"FIN"))
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());

        buf.put_u8(self.method as u8);
        buf.put_u64(self.seq);
        buf.put_u64(self.src);
        buf.put_u64(self.dst);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Decode a frame from a complete buffer
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                what: "frame header",
                needed: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let method = Method::try_from(buf.get_u8())?;
        let seq = buf.get_u64();
        let src = buf.get_u64();
        let dst = buf.get_u64();
        let payload_len = buf.get_u32() as usize;

        if buf.remaining() < payload_len {
            return Err(ProtocolError::Truncated {
                what: "frame payload",
                needed: payload_len,
                actual: buf.remaining(),
            });
        }

        Ok(Self {
            method,
            seq,
            src,
            dst,
            payload: Bytes::copy_from_slice(&buf[..payload_len]),
        })
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_DATAGRAM_SIZE;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::fwd(42, 3, 9, Bytes::from_static(b"Hello, World!"));
        let encoded = original.encode();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 13);

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_empty_and_large_payload() {
        let empty = Frame::new(Method::Fwd, 0, 1, 2, Bytes::new());
        assert_eq!(Frame::decode(&empty.encode()).unwrap(), empty);

        let large = Frame::fwd(7, 1, 2, Bytes::from(vec![0xabu8; MAX_DATAGRAM_SIZE]));
        assert_eq!(Frame::decode(&large.encode()).unwrap(), large);
    }

    #[test]
    fn test_conn_frame() {
        let frame = Frame::conn(5, "example.com:443");
        let decoded = Frame::decode(&frame.encode()).unwrap();

        assert_eq!(decoded.method, Method::Conn);
        assert_eq!(decoded.src, 5);
        assert_eq!(&decoded.payload[..], b"example.com:443");
    }

    #[test]
    fn test_truncated_header() {
        let encoded = Frame::ack(1, 2, 3).encode();
        assert!(matches!(
            Frame::decode(&encoded[..FRAME_HEADER_SIZE - 1]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let encoded = Frame::conn(1, "example.com:443").encode();
        assert!(matches!(
            Frame::decode(&encoded[..encoded.len() - 1]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_method() {
        let mut encoded = Frame::ping().encode();
        encoded[0] = 0xee;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(ProtocolError::UnknownMethod(0xee))
        ));
    }
}
