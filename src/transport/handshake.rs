//! Session handshake
//!
//! ```text
//! client                                          server
//!   | INIT  {pkey1 + padding to 1200}   (secret)    |
//!   |---------------------------------------------->|
//!   | RETRY {retry token}               (secret)    |
//!   |<----------------------------------------------|
//!   | RETRY {retry token echoed}        (secret)    |
//!   |---------------------------------------------->|
//!   | AUTH  {cid, AuthToken with pkey2} (pkey1)     |
//!   |<----------------------------------------------|
//!   | OK    {HMAC(pkey2, challenge)}    (pkey2)     |
//!   |---------------------------------------------->|
//! ```
//!
//! Every step is bounded by the handshake timeout. Any failure aborts the
//! handshake; starting over is up to the caller.

use super::{Datagram, TransportConfig, TransportError};
use crate::crypto::{
    hmac_sha256, random_key, verify_hmac_sha256, AuthToken, RetryToken, KEY_LEN,
};
use crate::obfuscation::Obfuscator;
use crate::protocol::{Method, ProtocolError, MAX_DATAGRAM_SIZE};
use crate::tunnel::Packet;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Client sent INIT, waiting for RETRY
    InitSent,
    /// Client echoed the retry token, waiting for AUTH
    RetryReceived,
    /// Server sent the retry token, waiting for the echo
    RetrySent,
    /// Server sent AUTH, waiting for OK
    AuthExchanged,
    Established,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::InitSent => "InitSent",
            HandshakeState::RetryReceived => "RetryReceived",
            HandshakeState::RetrySent => "RetrySent",
            HandshakeState::AuthExchanged => "AuthExchanged",
            HandshakeState::Established => "Established",
        };
        f.write_str(name)
    }
}

/// Result of a successful handshake
#[derive(Clone, PartialEq, Eq)]
pub struct Established {
    /// Connection id assigned by the server
    pub conn_id: u64,
    /// Session key (pkey2)
    pub key: [u8; KEY_LEN],
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("conn_id", &self.conn_id)
            .finish_non_exhaustive()
    }
}

/// Run the client side of the handshake against `server`
pub async fn client_handshake(
    socket: &dyn Datagram,
    server: SocketAddr,
    config: &TransportConfig,
) -> Result<Established, TransportError> {
    let secret = Obfuscator::new(config.protocol, &config.secret)?;
    let pkey1 = random_key()?;

    send(socket, server, &secret, &Packet::init(&pkey1)?).await?;
    trace!("INIT sent to {}", server);

    // RETRY: echo the token back unchanged
    let retry = recv_from_peer(
        socket,
        server,
        &secret,
        config.handshake_timeout,
        HandshakeState::InitSent,
    )
    .await?;
    retry.validate(0, Method::Retry, 0, 0, 0)?;
    send(socket, server, &secret, &Packet::retry(&retry.payload)).await?;
    trace!("Retry token echoed to {}", server);

    // AUTH: the server proves the shared secret and hands over pkey2
    let transitional = Obfuscator::new(config.protocol, &pkey1)?;
    let auth = recv_from_peer(
        socket,
        server,
        &transitional,
        config.handshake_timeout,
        HandshakeState::RetryReceived,
    )
    .await?;
    auth.validate(auth.conn_id, Method::Auth, 0, 0, 0)?;
    if auth.conn_id == 0 {
        return Err(TransportError::HandshakeRejected(
            "server assigned connection id 0".into(),
        ));
    }

    let token = AuthToken::decode(&auth.payload)?;
    if !token.validate(&config.secret, &pkey1) {
        return Err(TransportError::HandshakeRejected(
            "server failed to prove the shared secret".into(),
        ));
    }

    let session = Obfuscator::new(config.protocol, &token.key)?;
    let proof = hmac_sha256(&token.key, &token.challenge);
    let ok = Packet::new(auth.conn_id, Method::Ok, 0, 0, 0, Bytes::copy_from_slice(&proof));
    send(socket, server, &session, &ok).await?;

    debug!("Handshake with {} established (cid {})", server, auth.conn_id);
    Ok(Established {
        conn_id: auth.conn_id,
        key: token.key,
    })
}

/// Run the server side of the handshake for `peer`.
///
/// `init` is the datagram that carried INIT; later datagrams from the peer
/// arrive on `inbox`.
pub async fn server_handshake(
    socket: &dyn Datagram,
    peer: SocketAddr,
    conn_id: u64,
    init: &[u8],
    inbox: &mut mpsc::Receiver<Bytes>,
    config: &TransportConfig,
) -> Result<Established, TransportError> {
    let secret = Obfuscator::new(config.protocol, &config.secret)?;

    let hello = open(&secret, init)?;
    hello.validate(0, Method::Init, 0, 0, 0)?;
    if hello.payload.len() < KEY_LEN {
        return Err(ProtocolError::Truncated {
            what: "INIT key",
            needed: KEY_LEN,
            actual: hello.payload.len(),
        }
        .into());
    }
    let mut pkey1 = [0u8; KEY_LEN];
    pkey1.copy_from_slice(&hello.payload[..KEY_LEN]);

    // RETRY: confirm the peer owns its source address
    let token = RetryToken::new(peer.ip(), &config.secret);
    send(socket, peer, &secret, &Packet::retry(token.as_bytes())).await?;
    trace!("Retry token sent to {}", peer);

    let data = next(inbox, config.handshake_timeout, HandshakeState::RetrySent).await?;
    let echo = open(&secret, &data)?;
    echo.validate(0, Method::Retry, 0, 0, 0)?;
    if !RetryToken::validate(&echo.payload, peer.ip(), &config.secret) {
        return Err(TransportError::HandshakeRejected(format!(
            "invalid retry token from {}",
            peer
        )));
    }

    // AUTH under pkey1
    let key = random_key()?;
    let auth = AuthToken::new(hmac_sha256(&config.secret, &pkey1), key)?;
    let transitional = Obfuscator::new(config.protocol, &pkey1)?;
    let packet = Packet::new(conn_id, Method::Auth, 0, 0, 0, Bytes::from(auth.encode()));
    send(socket, peer, &transitional, &packet).await?;
    trace!("AUTH sent to {} (cid {})", peer, conn_id);

    // OK under pkey2 proves the client recovered the session key
    let data = next(inbox, config.handshake_timeout, HandshakeState::AuthExchanged).await?;
    let session = Obfuscator::new(config.protocol, &key)?;
    let ok = open(&session, &data)?;
    ok.validate(conn_id, Method::Ok, 0, 0, 0)?;
    if !verify_hmac_sha256(&key, &auth.challenge, &ok.payload) {
        return Err(TransportError::HandshakeRejected(format!(
            "bad session key proof from {}",
            peer
        )));
    }

    debug!("Handshake with {} established (cid {})", peer, conn_id);
    Ok(Established { conn_id, key })
}

/// Decode one datagram into a packet
pub(crate) fn open(obfuscator: &Obfuscator, data: &[u8]) -> Result<Packet, TransportError> {
    let plaintext = obfuscator.decode(data)?;
    Ok(Packet::decode(&plaintext)?)
}

/// Encode a packet into one datagram
pub(crate) fn seal(obfuscator: &Obfuscator, packet: &Packet) -> Result<Vec<u8>, TransportError> {
    Ok(obfuscator.encode(&packet.encode())?)
}

async fn send(
    socket: &dyn Datagram,
    peer: SocketAddr,
    obfuscator: &Obfuscator,
    packet: &Packet,
) -> Result<(), TransportError> {
    let datagram = seal(obfuscator, packet)?;
    socket.send_to(&datagram, peer).await?;
    Ok(())
}

async fn recv_from_peer(
    socket: &dyn Datagram,
    peer: SocketAddr,
    obfuscator: &Obfuscator,
    timeout: Duration,
    state: HandshakeState,
) -> Result<Packet, TransportError> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let deadline = Instant::now() + timeout;

    loop {
        let (n, from) = time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(state))??;

        if from != peer {
            trace!("Ignoring datagram from {} during handshake", from);
            continue;
        }
        return open(obfuscator, &buf[..n]);
    }
}

async fn next(
    inbox: &mut mpsc::Receiver<Bytes>,
    timeout: Duration,
    state: HandshakeState,
) -> Result<Bytes, TransportError> {
    match time::timeout(timeout, inbox.recv()).await {
        Ok(Some(data)) => Ok(data),
        Ok(None) => Err(TransportError::Closed),
        Err(_) => Err(TransportError::HandshakeTimeout(state)),
    }
}
