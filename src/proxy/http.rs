//! HTTP CONNECT proxy implementation

use super::{Address, ProxyError};
use crate::transport::Client;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Reply sent once the tunnel stream is open
pub const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Reply sent when the tunnel could not open the stream
pub const RESPONSE_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";

/// Upper bound on the request head
const MAX_REQUEST_HEAD: usize = 8192;

/// HTTP CONNECT proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
}

impl HttpProxyServer {
    /// Create a new HTTP proxy server
    pub async fn bind(addr: SocketAddr) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP proxy server listening on {}", listener.local_addr()?);

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections and tunnel each one through `client`
    pub async fn run(&self, client: &Client) -> Result<(), ProxyError> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New HTTP proxy connection from {}", peer_addr);

            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, client).await {
                    warn!("HTTP proxy connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, client: Client) -> Result<(), ProxyError> {
    let _ = stream.set_nodelay(true);
    let mut reader = BufReader::new(stream);

    let address = match read_connect_request(&mut reader).await {
        Ok(address) => address,
        Err(ProxyError::Io(e)) => return Err(e.into()),
        Err(e) => {
            let reply = if matches!(e, ProxyError::UnsupportedMethod(_)) {
                RESPONSE_METHOD_NOT_ALLOWED
            } else {
                RESPONSE_BAD_REQUEST
            };
            reader.get_mut().write_all(reply).await?;
            return Err(e);
        }
    };

    // Bytes the client pipelined after the request head
    let leftover = Bytes::copy_from_slice(reader.buffer());
    let mut stream = reader.into_inner();

    debug!("HTTP CONNECT to {}", address);
    let link = match client.open_stream(&address.to_string()).await {
        Ok(link) => link,
        Err(e) => {
            stream.write_all(RESPONSE_BAD_GATEWAY).await?;
            return Err(e.into());
        }
    };

    stream.write_all(RESPONSE_ESTABLISHED).await?;

    let stats = client.bridge(stream, link, leftover).await?;
    debug!(
        "CONNECT {} finished ({} bytes up, {} bytes down)",
        address, stats.sent, stats.received
    );
    Ok(())
}

/// Read a CONNECT request head and return its target.
///
/// Headers are consumed and ignored. Anything after the blank line stays
/// in `reader`'s buffer.
pub async fn read_connect_request<R>(reader: &mut R) -> Result<Address, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head_len = 0usize;

    // Read the request line
    let mut request_line = String::new();
    head_len += read_head_line(reader, &mut request_line, head_len).await?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(ProxyError::InvalidRequest(format!(
            "bad request line {:?}",
            request_line.trim()
        )));
    }

    let method = parts[0];
    let target = parts[1];

    // Read headers
    loop {
        let mut line = String::new();
        let n = read_head_line(reader, &mut line, head_len).await?;
        if n == 0 {
            return Err(ProxyError::InvalidRequest("unterminated request head".into()));
        }
        head_len += n;

        if line.trim().is_empty() {
            break;
        }
    }

    // Only support CONNECT method
    if method != "CONNECT" {
        return Err(ProxyError::UnsupportedMethod(method.to_string()));
    }

    Address::parse(target)
}

/// Read one line of the request head, never past [`MAX_REQUEST_HEAD`] in total
async fn read_head_line<R>(reader: &mut R, line: &mut String, used: usize) -> Result<usize, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_REQUEST_HEAD.saturating_sub(used);
    let n = (&mut *reader)
        .take(limit as u64 + 1)
        .read_line(line)
        .await?;

    if n > limit {
        return Err(ProxyError::InvalidRequest("request head too large".into()));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_connect_request() {
        let request = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let mut reader = BufReader::new(&request[..]);

        let address = read_connect_request(&mut reader).await.unwrap();
        assert_eq!(address, Address::Domain("example.com".into(), 443));
    }

    #[tokio::test]
    async fn test_pipelined_bytes_remain_buffered() {
        let request = b"CONNECT 10.0.0.1:22 HTTP/1.1\r\n\r\nSSH-2.0-client\r\n";
        let mut reader = BufReader::new(&request[..]);

        read_connect_request(&mut reader).await.unwrap();
        assert_eq!(reader.buffer(), b"SSH-2.0-client\r\n");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"SSH-2.0-client\r\n");
    }

    #[tokio::test]
    async fn test_other_methods_rejected() {
        let request = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut reader = BufReader::new(&request[..]);

        assert!(matches!(
            read_connect_request(&mut reader).await,
            Err(ProxyError::UnsupportedMethod(m)) if m == "GET"
        ));
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        for request in [
            &b"CONNECT\r\n\r\n"[..],
            &b"CONNECT example.com:443 HTTP/1.1\r\nHost: x\r\n"[..],
            &b"CONNECT example.com HTTP/1.1\r\n\r\n"[..],
        ] {
            let mut reader = BufReader::new(request);
            assert!(read_connect_request(&mut reader).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_endless_request_line() {
        let request = vec![b'A'; MAX_REQUEST_HEAD * 4];
        let mut reader = BufReader::new(&request[..]);

        assert!(matches!(
            read_connect_request(&mut reader).await,
            Err(ProxyError::InvalidRequest(_))
        ));
        // Reading stopped at the limit
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.len() >= MAX_REQUEST_HEAD * 2);
    }

    #[tokio::test]
    async fn test_oversized_head() {
        let mut request = b"CONNECT example.com:443 HTTP/1.1\r\n".to_vec();
        for _ in 0..400 {
            request.extend_from_slice(b"X-Padding: aaaaaaaaaaaaaaaaaaaa\r\n");
        }
        request.extend_from_slice(b"\r\n");

        let mut reader = BufReader::new(&request[..]);
        assert!(matches!(
            read_connect_request(&mut reader).await,
            Err(ProxyError::InvalidRequest(_))
        ));
    }
}
