//! RCON client session
//!
//! The [`Session`] drives one logical link to a game server:
//!
//! ```text
//! Disconnected -> Authenticating -> Authenticated -> Reconnecting -> Authenticating ...
//!       ^                                                                  |
//!       +---------------- shutdown / rejected credentials -----------------+
//! ```
//!
//! After the initial login succeeds, a supervisor task runs the read loop and
//! the keepalive ticker side by side. When the ticker decides the link is
//! dead, or the socket fails, the supervisor tears the connection down,
//! evicts everything still outstanding and logs in again after a backoff
//! delay.
//!
//! Commands are correlated with their responses purely by sequence number.
//! `run_command` registers the sequence before sending, so a fast response
//! always finds its transmission. Keepalives consume a free sequence but are
//! tracked only through the connection's counters, never through the table.
//!
//! Server messages live in the server's own sequence space. Each one is
//! acknowledged immediately, reassembled if split, and routed to the chat
//! sink or the event sink depending on its channel tag.

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{SessionError, TableError};
use crate::sink::SharedSink;
use crate::transmission::TransmissionTable;
use log::{debug, error, info, trace, warn};
use shared::{decode, Multipart, Packet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// Channel tags that mark a server message as player chat
pub const CHAT_CHANNELS: [&str; 7] = [
    "(Global)",
    "(Side)",
    "(Command)",
    "(Group)",
    "(Vehicle)",
    "(Direct)",
    "(Unknown)",
];

/// Authentication state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Authenticating,
    Authenticated,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Why a connection stopped being usable
enum LinkLoss {
    Shutdown,
    Dead,
    Transport(SessionError),
}

/// Whether a server message belongs to the chat stream.
pub fn is_chat(message: &str) -> bool {
    CHAT_CHANNELS
        .iter()
        .any(|channel| message.starts_with(channel))
}

fn part_position(multipart: Option<Multipart>) -> (u8, u8) {
    multipart.map_or((1, 0), |part| (part.total, part.index))
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

/// A supervised RCON session
pub struct Session {
    config: ClientConfig,
    state: watch::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
    connection: RwLock<Option<Arc<Connection>>>,

    /// Commands awaiting a response
    transmissions: TransmissionTable,
    /// Split server messages being reassembled
    broadcasts: TransmissionTable,
    last_broadcast: Mutex<Option<u8>>,

    chat: RwLock<Option<SharedSink>>,
    events: RwLock<Option<SharedSink>>,

    command_since_tick: AtomicBool,
    ack_since_tick: AtomicBool,
    reconnects: AtomicU64,
    /// Held from the initial login until the supervisor is spawned
    startup: AsyncMutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            state,
            shutdown,
            connection: RwLock::new(None),
            transmissions: TransmissionTable::new(),
            broadcasts: TransmissionTable::new(),
            last_broadcast: Mutex::new(None),
            chat: RwLock::new(None),
            events: RwLock::new(None),
            command_since_tick: AtomicBool::new(false),
            ack_since_tick: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            startup: AsyncMutex::new(()),
            supervisor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch channel that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Number of times a live link was lost and a reconnect was started.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Number of commands still waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.transmissions.len()
    }

    /// Acknowledgements received on the current connection.
    pub async fn pingback_count(&self) -> u64 {
        self.connection
            .read()
            .await
            .as_ref()
            .map_or(0, |connection| connection.pingback())
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Session state {} -> {}", previous, next);
        }
    }

    /// Replaces the destination for chat messages.
    pub async fn set_chat_writer(&self, sink: SharedSink) {
        *self.chat.write().await = Some(sink);
    }

    /// Replaces the destination for non-chat server events.
    pub async fn set_event_writer(&self, sink: SharedSink) {
        *self.events.write().await = Some(sink);
    }

    /// Logs in and starts supervising the link.
    ///
    /// The initial login is performed inline and its failure is returned to
    /// the caller with the session left `Disconnected`. On success the read
    /// loop, keepalive ticker and reconnect logic run in a background task
    /// until [`Session::shutdown`] is called. Concurrent calls are serialized
    /// and only the first one logs in.
    pub async fn watcher_loop(self: &Arc<Self>) -> Result<(), SessionError> {
        let _starting = self.startup.lock().await;
        if *self.shutdown.borrow() {
            return Err(SessionError::Shutdown);
        }
        if self.supervisor_running() {
            debug!("Session supervisor already running");
            return Ok(());
        }

        info!("Connecting to RCON at {}", self.config.address);
        self.set_state(SessionState::Authenticating);
        let connection = match self.establish().await {
            Ok(connection) => connection,
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                error!("Login to {} failed: {}", self.config.address, e);
                return Err(e);
            }
        };

        self.install(Arc::clone(&connection)).await;
        self.set_state(SessionState::Authenticated);

        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.supervise(connection).await });
        *lock(&self.supervisor) = Some(handle);
        Ok(())
    }

    fn supervisor_running(&self) -> bool {
        lock(&self.supervisor)
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Sends a command without waiting for its response.
    ///
    /// The assembled response is handed to `sink` by the read loop once every
    /// part has arrived. Returns the sequence number the command was sent
    /// under.
    pub async fn run_command(
        &self,
        text: &str,
        sink: Option<SharedSink>,
    ) -> Result<u8, SessionError> {
        if self.state() != SessionState::Authenticated {
            return Err(SessionError::NotConnected);
        }
        let connection = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(SessionError::NotConnected)?;

        let sequence = self.register_command(&connection, sink)?;
        if let Err(e) = connection
            .send_packet(&Packet::command(sequence, text))
            .await
        {
            self.transmissions.evict(sequence);
            return Err(e);
        }

        self.command_since_tick.store(true, Ordering::SeqCst);
        debug!("Sent command {:?} as sequence {}", text, sequence);
        Ok(sequence)
    }

    /// Picks the next sequence number not held by an outstanding command and
    /// registers it. Fails once all 256 numbers are in use.
    fn register_command(
        &self,
        connection: &Connection,
        sink: Option<SharedSink>,
    ) -> Result<u8, SessionError> {
        for _ in 0..=u8::MAX {
            let sequence = connection.next_sequence();
            match self.transmissions.register(sequence, sink.clone()) {
                Ok(()) => return Ok(sequence),
                Err(_) => trace!("Sequence {} still outstanding, skipping", sequence),
            }
        }
        warn!("All sequence numbers are outstanding, rejecting command");
        Err(SessionError::Saturated)
    }

    fn free_sequence(&self, connection: &Connection) -> Option<u8> {
        (0..=u8::MAX)
            .map(|_| connection.next_sequence())
            .find(|&sequence| !self.transmissions.contains(sequence))
    }

    /// Stops the supervisor, closes the connection and evicts everything.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let handle = lock(&self.supervisor).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Session supervisor panicked: {}", e);
            }
        }

        let current = self.connection.write().await.take();
        if let Some(connection) = current {
            connection.close();
        }
        self.transmissions.clear();
        self.broadcasts.clear();
        self.set_state(SessionState::Disconnected);
        info!("RCON session closed");
    }

    async fn establish(&self) -> Result<Arc<Connection>, SessionError> {
        let connection = Connection::connect(self.config.address).await?;
        if let Err(e) = connection
            .login(&self.config.password, self.config.login_timeout)
            .await
        {
            connection.close();
            return Err(e);
        }
        Ok(Arc::new(connection))
    }

    async fn install(&self, connection: Arc<Connection>) {
        *self.connection.write().await = Some(connection);
        self.command_since_tick.store(false, Ordering::SeqCst);
        self.ack_since_tick.store(false, Ordering::SeqCst);
        *lock(&self.last_broadcast) = None;
    }

    async fn teardown(&self, connection: &Arc<Connection>) {
        {
            let mut current = self.connection.write().await;
            if current
                .as_ref()
                .map_or(false, |c| Arc::ptr_eq(c, connection))
            {
                *current = None;
            }
        }
        connection.close();

        let dropped = self.transmissions.clear();
        self.broadcasts.clear();
        if dropped > 0 {
            warn!(
                "Dropped {} outstanding commands with the connection to {}",
                dropped,
                connection.peer()
            );
        }
    }

    async fn supervise(self: Arc<Self>, mut connection: Arc<Connection>) {
        loop {
            let loss = self.run_connection(&connection).await;
            self.teardown(&connection).await;

            match loss {
                LinkLoss::Shutdown => break,
                LinkLoss::Dead => {
                    warn!("Link to {} is dead, reconnecting", connection.peer());
                }
                LinkLoss::Transport(e) => {
                    warn!(
                        "Connection to {} failed: {}, reconnecting",
                        connection.peer(),
                        e
                    );
                }
            }

            self.reconnects.fetch_add(1, Ordering::SeqCst);
            self.set_state(SessionState::Reconnecting);

            match self.reconnect().await {
                Some(next) => {
                    self.install(Arc::clone(&next)).await;
                    self.set_state(SessionState::Authenticated);
                    connection = next;
                }
                None => break,
            }
        }

        self.set_state(SessionState::Disconnected);
    }

    async fn reconnect(&self) -> Option<Arc<Connection>> {
        let policy = &self.config.reconnect;
        let address = self.config.address;
        let mut shutdown = self.shutdown.subscribe();
        let mut attempt = 0;

        loop {
            if !policy.allows(attempt) {
                error!(
                    "Giving up on {} after {} reconnect attempts",
                    address, attempt
                );
                return None;
            }

            let delay = policy.delay(attempt);
            info!(
                "Reconnecting to {} in {:?} (attempt {})",
                address,
                delay,
                attempt + 1
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => return None,
            }

            self.set_state(SessionState::Authenticating);
            match self.establish().await {
                Ok(connection) => {
                    info!("Reconnected to {}", address);
                    return Some(connection);
                }
                Err(SessionError::InvalidLogin) => {
                    error!(
                        "Server {} rejected the RCON password; not retrying with the same credentials",
                        address
                    );
                    return None;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt + 1, e);
                    self.set_state(SessionState::Reconnecting);
                }
            }
            attempt += 1;
        }
    }

    async fn run_connection(&self, connection: &Arc<Connection>) -> LinkLoss {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            loss = self.read_loop(connection) => loss,
            loss = self.keep_alive_loop(connection) => loss,
            _ = wait_for_shutdown(&mut shutdown) => LinkLoss::Shutdown,
        }
    }

    async fn read_loop(&self, connection: &Connection) -> LinkLoss {
        loop {
            match connection.receive(None).await {
                Ok(bytes) => self.dispatch(connection, &bytes).await,
                Err(e) => return LinkLoss::Transport(e),
            }
        }
    }

    async fn keep_alive_loop(&self, connection: &Connection) -> LinkLoss {
        let period = self.config.keep_alive_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.evict_stale();

            let unanswered = if self.ack_since_tick.swap(false, Ordering::SeqCst) {
                connection.keep_alive()
            } else {
                connection.add_keep_alive()
            };

            // A command sent since the last tick stands in for the keepalive
            if !self.command_since_tick.swap(false, Ordering::SeqCst) {
                match self.free_sequence(connection) {
                    Some(sequence) => {
                        if let Err(e) = connection.send_packet(&Packet::command(sequence, "")).await
                        {
                            return LinkLoss::Transport(e);
                        }
                    }
                    None => debug!("No free sequence for keepalive"),
                }
            }

            trace!("Keepalive tick, {} intervals unanswered", unanswered);
            if unanswered > self.config.keep_alive_tolerance {
                warn!(
                    "{} keepalive intervals to {} went unanswered",
                    unanswered,
                    connection.peer()
                );
                return LinkLoss::Dead;
            }
        }
    }

    fn evict_stale(&self) {
        let max_age = self.config.transmission_timeout;
        let evicted = self.transmissions.evict_stale(max_age);
        if !evicted.is_empty() {
            warn!(
                "Evicted {} commands unanswered after {:?}: {:?}",
                evicted.len(),
                max_age,
                evicted
            );
        }
        let abandoned = self.broadcasts.evict_stale(max_age);
        if !abandoned.is_empty() {
            debug!("Abandoned incomplete server messages {:?}", abandoned);
        }
    }

    async fn dispatch(&self, connection: &Connection, bytes: &[u8]) {
        let packet = match decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping datagram: {}", e);
                return;
            }
        };

        match packet {
            Packet::Login { .. } => {
                debug!("Ignoring login response after handshake");
            }
            Packet::Command {
                sequence,
                multipart,
                payload,
            } => {
                self.note_ack(connection);
                self.handle_command_ack(sequence, multipart, &payload);
            }
            Packet::ServerMessage {
                sequence,
                multipart,
                payload,
            } => {
                if let Err(e) = connection.send_packet(&Packet::server_ack(sequence)).await {
                    warn!("Failed to acknowledge server message {}: {}", sequence, e);
                }
                self.note_ack(connection);
                self.handle_server_message(sequence, multipart, &payload)
                    .await;
            }
        }
    }

    fn note_ack(&self, connection: &Connection) {
        connection.add_pingback();
        connection.reset_keep_alive();
        self.ack_since_tick.store(true, Ordering::SeqCst);
    }

    fn handle_command_ack(&self, sequence: u8, multipart: Option<Multipart>, payload: &[u8]) {
        let (total, index) = part_position(multipart);
        match self.transmissions.append_part(sequence, total, index, payload) {
            Ok(true) => {
                if let Some(transmission) = self.transmissions.complete(sequence) {
                    debug!(
                        "Command {} answered after {:?}",
                        sequence,
                        transmission.issued_at.elapsed()
                    );
                    if let Some(sink) = &transmission.sink {
                        sink.deliver(String::from_utf8_lossy(&transmission.assembled()).into_owned());
                    }
                }
            }
            Ok(false) => {
                trace!("Command {}: part {} of {} received", sequence, index + 1, total);
            }
            Err(TableError::Unknown(_)) => {
                debug!("Dropping ack for unknown sequence {}", sequence);
            }
            Err(e) => {
                warn!("Dropping response part: {}", e);
            }
        }
    }

    async fn handle_server_message(
        &self,
        sequence: u8,
        multipart: Option<Multipart>,
        payload: &[u8],
    ) {
        let message = match multipart {
            None => payload.to_vec(),
            Some(part) => {
                if !self.broadcasts.contains(sequence) {
                    let _ = self.broadcasts.register(sequence, None);
                }
                match self
                    .broadcasts
                    .append_part(sequence, part.total, part.index, payload)
                {
                    Ok(true) => match self.broadcasts.complete(sequence) {
                        Some(transmission) => transmission.assembled(),
                        None => return,
                    },
                    Ok(false) => return,
                    Err(e) => {
                        warn!("Dropping server message part: {}", e);
                        self.broadcasts.evict(sequence);
                        return;
                    }
                }
            }
        };

        {
            let mut last = lock(&self.last_broadcast);
            if *last == Some(sequence) {
                debug!("Dropping repeated server message {}", sequence);
                return;
            }
            *last = Some(sequence);
        }

        let text = String::from_utf8_lossy(&message).into_owned();
        let (stream, sink) = if is_chat(&text) {
            ("chat", self.chat.read().await.clone())
        } else {
            ("event", self.events.read().await.clone())
        };

        match sink {
            Some(sink) => sink.deliver(text),
            None => debug!("No {} sink set, discarding: {}", stream, text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::shared;
    use ::shared::{LOGIN_SUCCESS, MAX_DATAGRAM};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// Loopback peer that completes a login and then lets the test script it.
    struct FakeServer {
        socket: UdpSocket,
        client: Option<SocketAddr>,
    }

    impl FakeServer {
        async fn bind() -> (Self, SocketAddr) {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = socket.local_addr().unwrap();
            (
                Self {
                    socket,
                    client: None,
                },
                addr,
            )
        }

        async fn recv(&mut self) -> Packet {
            let mut buf = [0u8; MAX_DATAGRAM];
            let (len, from) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
                .await
                .expect("fake server timed out")
                .unwrap();
            self.client = Some(from);
            decode(&buf[..len]).unwrap()
        }

        async fn send(&self, packet: Packet) {
            let client = self.client.expect("no client yet");
            self.socket.send_to(&packet.encode(), client).await.unwrap();
        }

        async fn accept_login(&mut self) {
            assert!(matches!(self.recv().await, Packet::Login { .. }));
            self.send(Packet::Login {
                payload: vec![LOGIN_SUCCESS],
            })
            .await;
        }
    }

    fn test_config(addr: SocketAddr) -> ClientConfig {
        ClientConfig::new(addr, "secret")
            .with_keep_alive(Duration::from_secs(60), 3)
            .with_login_timeout(Duration::from_millis(500))
    }

    #[test]
    fn test_chat_classification() {
        assert!(is_chat("(Global) Miller: hello"));
        assert!(is_chat("(Side) Kerry: go"));
        assert!(is_chat("(Vehicle) x"));
        assert!(!is_chat("Player #1 Miller (127.0.0.1:2304) connected"));
        assert!(!is_chat("RCon admin #0 (127.0.0.1:5000) logged in"));
        assert!(!is_chat("Global without brackets"));
    }

    #[test]
    fn test_part_position() {
        assert_eq!(part_position(None), (1, 0));
        assert_eq!(part_position(Some(Multipart { total: 3, index: 1 })), (3, 1));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::default(), SessionState::Disconnected);
        assert_eq!(SessionState::Reconnecting.to_string(), "Reconnecting");
    }

    #[tokio::test]
    async fn test_run_command_requires_login() {
        let session = Session::new(test_config("127.0.0.1:9".parse().unwrap()));
        let result = session.run_command("players", None).await;
        assert!(matches!(result, Err(SessionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_watcher_loop_after_shutdown() {
        let session = Session::new(test_config("127.0.0.1:9".parse().unwrap()));
        session.shutdown().await;
        assert!(matches!(
            session.watcher_loop().await,
            Err(SessionError::Shutdown)
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_multipart_command_response() {
        let (mut server, addr) = FakeServer::bind().await;
        let session = Session::new(test_config(addr));

        let login = tokio::spawn(async move {
            server.accept_login().await;
            server
        });
        session.watcher_loop().await.unwrap();
        let mut server = login.await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sequence = session.run_command("players", Some(shared(tx))).await.unwrap();

        let request = server.recv().await;
        assert_eq!(request, Packet::command(sequence, "players"));

        for (index, chunk) in [(1u8, "CD"), (0, "AB"), (2, "EF")] {
            server
                .send(Packet::Command {
                    sequence,
                    multipart: Some(Multipart { total: 3, index }),
                    payload: chunk.as_bytes().to_vec(),
                })
                .await;
        }

        let response = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, "ABCDEF");
        assert_eq!(session.outstanding(), 0);
        assert_eq!(session.pingback_count().await, 3);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_messages_are_acked_and_routed() {
        let (mut server, addr) = FakeServer::bind().await;
        let session = Session::new(test_config(addr));

        let (chat_tx, mut chat_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        session.set_chat_writer(shared(chat_tx)).await;
        session.set_event_writer(shared(event_tx)).await;

        let login = tokio::spawn(async move {
            server.accept_login().await;
            server
        });
        session.watcher_loop().await.unwrap();
        let mut server = login.await.unwrap();

        server
            .send(Packet::ServerMessage {
                sequence: 0,
                multipart: None,
                payload: b"(Global) Miller: hello".to_vec(),
            })
            .await;
        assert_eq!(server.recv().await, Packet::server_ack(0));

        // Repeated because the ack was "lost"
        server
            .send(Packet::ServerMessage {
                sequence: 0,
                multipart: None,
                payload: b"(Global) Miller: hello".to_vec(),
            })
            .await;
        assert_eq!(server.recv().await, Packet::server_ack(0));

        server
            .send(Packet::ServerMessage {
                sequence: 1,
                multipart: None,
                payload: b"Player #3 Kerry disconnected".to_vec(),
            })
            .await;
        assert_eq!(server.recv().await, Packet::server_ack(1));

        let chat = timeout(Duration::from_secs(2), chat_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chat, "(Global) Miller: hello");

        let event = timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, "Player #3 Kerry disconnected");
        assert!(chat_rx.try_recv().is_err());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_split_server_message() {
        let (mut server, addr) = FakeServer::bind().await;
        let session = Session::new(test_config(addr));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        session.set_event_writer(shared(event_tx)).await;

        let login = tokio::spawn(async move {
            server.accept_login().await;
            server
        });
        session.watcher_loop().await.unwrap();
        let mut server = login.await.unwrap();

        for (index, chunk) in [(1u8, "CD"), (0, "AB"), (2, "EF")] {
            server
                .send(Packet::ServerMessage {
                    sequence: 7,
                    multipart: Some(Multipart { total: 3, index }),
                    payload: chunk.as_bytes().to_vec(),
                })
                .await;
            assert_eq!(server.recv().await, Packet::server_ack(7));
        }

        let event = timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, "ABCDEF");

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrapped_counter_skips_outstanding_sequence() {
        let (mut server, addr) = FakeServer::bind().await;
        let session = Session::new(test_config(addr));

        let login = tokio::spawn(async move {
            server.accept_login().await;
            server
        });
        session.watcher_loop().await.unwrap();
        let mut server = login.await.unwrap();

        assert_eq!(session.run_command("hold", None).await.unwrap(), 0);
        server.recv().await;

        for expected in 1..=u8::MAX {
            let sequence = session.run_command("say -1 hi", None).await.unwrap();
            assert_eq!(sequence, expected);
            server.recv().await;
            server.send(Packet::command(sequence, "")).await;
        }

        timeout(Duration::from_secs(2), async {
            while session.outstanding() > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(session.run_command("next", None).await.unwrap(), 1);
        assert_eq!(session.outstanding(), 2);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_watcher_loops_log_in_once() {
        let (mut server, addr) = FakeServer::bind().await;
        let session = Session::new(test_config(addr));

        let login = tokio::spawn(async move {
            server.accept_login().await;
            server
        });
        let (first, second) = tokio::join!(session.watcher_loop(), session.watcher_loop());
        first.unwrap();
        second.unwrap();
        let server = login.await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        assert!(
            timeout(Duration::from_millis(300), server.socket.recv_from(&mut buf))
                .await
                .is_err(),
            "a second login was sent"
        );
        assert_eq!(session.state(), SessionState::Authenticated);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_ack_is_dropped() {
        let (mut server, addr) = FakeServer::bind().await;
        let session = Session::new(test_config(addr));

        let login = tokio::spawn(async move {
            server.accept_login().await;
            server
        });
        session.watcher_loop().await.unwrap();
        let mut server = login.await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sequence = session.run_command("players", Some(shared(tx))).await.unwrap();
        server.recv().await;

        server.send(Packet::command(sequence.wrapping_add(100), "late")).await;
        server.send(Packet::command(sequence, "ok")).await;

        let response = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, "ok");
        assert_eq!(session.state(), SessionState::Authenticated);

        session.shutdown().await;
    }
}
