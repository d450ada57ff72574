//! Simulated RCON endpoint
//!
//! Answers the client side of the protocol the way a game server does:
//! password check on login, an acknowledgement (with a response payload) for
//! every command, and server messages that expect an ack. The [`Behavior`]
//! knob makes it misbehave in the ways a real server or network does.

use log::{debug, error, info, trace, warn};
use shared::{
    decode, split_response, CodecError, Packet, DEFAULT_MAX_PAYLOAD, LOGIN_FAILURE,
    LOGIN_SUCCESS, MAX_DATAGRAM,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot encode response: {0}")]
    Codec(#[from] CodecError),
}

/// How the responder reacts to incoming packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Normal,
    /// Never replies to anything
    Silent,
    /// Answers every login with the failure byte and stops serving the
    /// admin logged in before, like a server whose password was changed
    RejectLogin,
    /// Accepts logins, then ignores commands and keepalives
    SilentAfterLogin,
}

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub password: String,
    pub behavior: Behavior,
    /// Responses longer than this are split into multipart packets
    pub max_payload: usize,
}

impl ResponderConfig {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            behavior: Behavior::Normal,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

/// What the responder has seen so far
#[derive(Debug, Clone, Default)]
pub struct ResponderStats {
    /// Accepted logins
    pub logins: u64,
    pub rejected_logins: u64,
    /// Non-empty commands in arrival order
    pub commands: Vec<String>,
    pub keep_alives: u64,
    /// Sequences of server messages pushed with [`Responder::broadcast`]
    pub broadcasts: Vec<u8>,
    /// Sequences the client acknowledged
    pub acks: Vec<u8>,
    /// Datagrams that failed to decode
    pub dropped: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Canned answer to `players`, long enough to need several packets.
pub fn player_listing(count: usize) -> String {
    let mut listing = String::from(
        "Players on server:\n[#] [IP Address]:[Port] [Ping] [GUID] [Name]\n--------------------------------------------------\n",
    );
    for id in 0..count {
        listing.push_str(&format!(
            "{id}   10.0.{}.{}:2304 {:<4} {:032x}(OK) Player{id}\n",
            id / 250,
            id % 250 + 1,
            20 + id % 80,
            id as u128 * 0x9e37_79b9_7f4a_7c15
        ));
    }
    listing.push_str(&format!("({count} players in total)"));
    listing
}

pub struct Responder {
    socket: UdpSocket,
    config: ResponderConfig,
    behavior: Mutex<Behavior>,
    client: Mutex<Option<SocketAddr>>,
    stats: Mutex<ResponderStats>,
    broadcast_sequence: AtomicU8,
}

impl Responder {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: ResponderConfig,
    ) -> Result<Self, ResponderError> {
        let socket = UdpSocket::bind(addr).await?;
        info!("RCON responder listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            behavior: Mutex::new(config.behavior),
            config,
            client: Mutex::new(None),
            stats: Mutex::new(ResponderStats::default()),
            broadcast_sequence: AtomicU8::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ResponderError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn behavior(&self) -> Behavior {
        *lock(&self.behavior)
    }

    /// Switches behaviour while running.
    pub fn set_behavior(&self, behavior: Behavior) {
        let previous = std::mem::replace(&mut *lock(&self.behavior), behavior);
        if previous != behavior {
            info!("Responder behavior {:?} -> {:?}", previous, behavior);
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ResponderStats {
        lock(&self.stats).clone()
    }

    /// Address of the most recently logged-in client.
    pub fn client(&self) -> Option<SocketAddr> {
        *lock(&self.client)
    }

    /// Serves requests until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = [0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                received = self.socket.recv_from(&mut buffer) => received,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            match received {
                Ok((len, from)) => {
                    if let Err(e) = self.handle(&buffer[..len], from).await {
                        error!("Failed to answer {}: {}", from, e);
                    }
                }
                Err(e) => {
                    // ICMP errors from a vanished client surface here
                    debug!("Error receiving packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }

        info!("RCON responder stopped");
    }

    async fn handle(&self, bytes: &[u8], from: SocketAddr) -> Result<(), ResponderError> {
        let packet = match decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", from, e);
                lock(&self.stats).dropped += 1;
                return Ok(());
            }
        };
        let behavior = self.behavior();

        match packet {
            Packet::Login { payload } => {
                let accepted =
                    behavior != Behavior::RejectLogin && payload == self.config.password.as_bytes();
                {
                    let mut stats = lock(&self.stats);
                    if accepted {
                        stats.logins += 1;
                    } else {
                        stats.rejected_logins += 1;
                    }
                }

                if behavior == Behavior::Silent {
                    debug!("Staying silent on login from {}", from);
                    return Ok(());
                }
                if accepted {
                    *lock(&self.client) = Some(from);
                    info!("RCON admin logged in from {}", from);
                } else {
                    warn!("Rejected login from {}", from);
                }

                let status = if accepted { LOGIN_SUCCESS } else { LOGIN_FAILURE };
                self.send(&Packet::Login { payload: vec![status] }, from).await
            }
            Packet::Command {
                sequence, payload, ..
            } => {
                if self.client() != Some(from) {
                    debug!("Ignoring command from unauthenticated {}", from);
                    return Ok(());
                }

                let text = String::from_utf8_lossy(&payload).into_owned();
                {
                    let mut stats = lock(&self.stats);
                    if text.is_empty() {
                        stats.keep_alives += 1;
                    } else {
                        stats.commands.push(text.clone());
                    }
                }

                if matches!(
                    behavior,
                    Behavior::Silent | Behavior::SilentAfterLogin | Behavior::RejectLogin
                ) {
                    trace!("Ignoring command {} from {}", sequence, from);
                    return Ok(());
                }

                let response = self.respond_to(&text);
                for packet in split_response(sequence, response.as_bytes(), self.config.max_payload)? {
                    self.send(&packet, from).await?;
                }
                Ok(())
            }
            Packet::ServerMessage { sequence, .. } => {
                trace!("Client acknowledged server message {}", sequence);
                lock(&self.stats).acks.push(sequence);
                Ok(())
            }
        }
    }

    fn respond_to(&self, command: &str) -> String {
        match command {
            "" => String::new(),
            "players" => player_listing(60),
            other => other.to_string(),
        }
    }

    /// Pushes a server message to the logged-in client.
    ///
    /// Returns the sequence it went out under, or `None` when nobody is
    /// logged in.
    pub async fn broadcast(&self, text: &str) -> Result<Option<u8>, ResponderError> {
        let client = match self.client() {
            Some(client) => client,
            None => {
                debug!("No client to broadcast {:?} to", text);
                return Ok(None);
            }
        };

        let sequence = self.broadcast_sequence.fetch_add(1, Ordering::SeqCst);
        for part in split_response(sequence, text.as_bytes(), self.config.max_payload)? {
            let message = match part {
                Packet::Command {
                    sequence,
                    multipart,
                    payload,
                } => Packet::ServerMessage {
                    sequence,
                    multipart,
                    payload,
                },
                other => other,
            };
            self.send(&message, client).await?;
        }

        lock(&self.stats).broadcasts.push(sequence);
        Ok(Some(sequence))
    }

    async fn send(&self, packet: &Packet, to: SocketAddr) -> Result<(), ResponderError> {
        self.socket.send_to(&packet.encode(), to).await?;
        Ok(())
    }
}
