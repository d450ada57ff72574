//! UDP connection to the RCON endpoint
//!
//! A [`Connection`] owns one connected datagram socket plus the per-link
//! counters. It is shared between the read loop, the keepalive ticker and
//! any number of command issuers, so every operation takes `&self`:
//! - outbound datagrams are serialized by an async writer lock,
//! - the sequence, keepalive and pingback counters are atomics updated with
//!   `SeqCst` read-modify-write operations, so every increment and reset is
//!   atomic relative to all other callers.

use crate::error::SessionError;
use log::{debug, error, info, trace, warn};
use shared::{decode, Packet, LOGIN_FAILURE, LOGIN_SUCCESS, MAX_DATAGRAM};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

pub struct Connection {
    socket: UdpSocket,
    peer: SocketAddr,
    write_lock: Mutex<()>,
    closed: AtomicBool,

    sequence: AtomicU8,
    keep_alive_count: AtomicU64,
    pingback_count: AtomicU64,
}

impl Connection {
    /// Binds an ephemeral local socket and connects it to `address`.
    pub async fn connect(address: SocketAddr) -> Result<Self, SessionError> {
        let local: SocketAddr = if address.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(address).await?;
        debug!(
            "Opened RCON socket {} -> {}",
            socket.local_addr()?,
            address
        );

        Ok(Self {
            socket,
            peer: address,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            sequence: AtomicU8::new(0),
            keep_alive_count: AtomicU64::new(0),
            pingback_count: AtomicU64::new(0),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        Ok(self.socket.local_addr()?)
    }

    /// Marks the connection as closed; later sends and receives fail with
    /// [`SessionError::NotConnected`]. The socket itself is released when the
    /// last handle is dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closed RCON connection to {}", self.peer);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends one raw datagram.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::NotConnected);
        }
        let _guard = self.write_lock.lock().await;
        self.socket.send(bytes).await?;
        Ok(())
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<(), SessionError> {
        trace!("-> {:?} seq {:?}", packet.kind(), packet.sequence());
        self.send(&packet.encode()).await
    }

    /// Receives one raw datagram, waiting at most `deadline` if given.
    pub async fn receive(&self, deadline: Option<Duration>) -> Result<Vec<u8>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::NotConnected);
        }

        let mut buffer = [0u8; MAX_DATAGRAM];
        let len = match deadline {
            Some(limit) => timeout(limit, self.socket.recv(&mut buffer))
                .await
                .map_err(|_| SessionError::Timeout(limit))??,
            None => self.socket.recv(&mut buffer).await?,
        };
        Ok(buffer[..len].to_vec())
    }

    /// Runs the login handshake on this connection.
    ///
    /// Datagrams other than a login response are ignored until `deadline`
    /// expires. On success the keepalive and pingback counters are reset.
    pub async fn login(&self, password: &str, deadline: Duration) -> Result<(), SessionError> {
        self.send_packet(&Packet::login(password)).await?;
        let expires = Instant::now() + deadline;

        loop {
            let remaining = expires.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("No login response from {} within {:?}", self.peer, deadline);
                return Err(SessionError::Timeout(deadline));
            }

            let bytes = match self.receive(Some(remaining)).await {
                Ok(bytes) => bytes,
                Err(SessionError::Timeout(_)) => {
                    warn!("No login response from {} within {:?}", self.peer, deadline);
                    return Err(SessionError::Timeout(deadline));
                }
                Err(e) => {
                    error!("Login to {} failed: {}", self.peer, e);
                    return Err(e);
                }
            };

            match decode(&bytes) {
                Ok(Packet::Login { payload }) => match payload.first() {
                    Some(&LOGIN_SUCCESS) => {
                        self.reset_keep_alive();
                        self.reset_pingback();
                        info!("Logged in to {}", self.peer);
                        return Ok(());
                    }
                    Some(&LOGIN_FAILURE) => {
                        error!("Login to {} rejected: invalid password", self.peer);
                        return Err(SessionError::InvalidLogin);
                    }
                    other => {
                        debug!("Ignoring login response with status {:?}", other);
                    }
                },
                Ok(packet) => {
                    debug!("Ignoring {:?} packet during login", packet.kind());
                }
                Err(e) => {
                    debug!("Dropping datagram during login: {}", e);
                }
            }
        }
    }

    /// Current value of the outgoing sequence counter.
    pub fn sequence(&self) -> u8 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Returns the current sequence and advances the counter, wrapping at 256.
    pub fn next_sequence(&self) -> u8 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub fn keep_alive(&self) -> u64 {
        self.keep_alive_count.load(Ordering::SeqCst)
    }

    /// Increments the unanswered keepalive counter and returns the new value.
    pub fn add_keep_alive(&self) -> u64 {
        self.keep_alive_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_keep_alive(&self) {
        self.keep_alive_count.store(0, Ordering::SeqCst);
    }

    pub fn pingback(&self) -> u64 {
        self.pingback_count.load(Ordering::SeqCst)
    }

    pub fn add_pingback(&self) -> u64 {
        self.pingback_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_pingback(&self) {
        self.pingback_count.store(0, Ordering::SeqCst);
    }
}
