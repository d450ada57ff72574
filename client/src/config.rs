//! Session configuration
//!
//! A [`ClientConfig`] is built once by the caller and moved into the session.
//! Nothing in the client reads configuration from global state.

use shared::RetryPolicy;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEP_ALIVE_TOLERANCE: u64 = 3;
pub const DEFAULT_TRANSMISSION_TIMEOUT: Duration = Duration::from_secs(90);

/// Everything a session needs to reach and stay connected to a server
#[derive(Clone)]
pub struct ClientConfig {
    /// RCON endpoint of the game server
    pub address: SocketAddr,
    pub password: String,
    /// Idle time after which a keepalive is sent
    pub keep_alive_interval: Duration,
    /// Unanswered keepalives tolerated before the link is declared dead
    pub keep_alive_tolerance: u64,
    /// Deadline for the login response
    pub login_timeout: Duration,
    /// Age after which an unanswered command is evicted
    pub transmission_timeout: Duration,
    /// Backoff between reconnect attempts
    pub reconnect: RetryPolicy,
}

impl ClientConfig {
    pub fn new(address: SocketAddr, password: impl Into<String>) -> Self {
        Self {
            address,
            password: password.into(),
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_tolerance: DEFAULT_KEEP_ALIVE_TOLERANCE,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            transmission_timeout: DEFAULT_TRANSMISSION_TIMEOUT,
            reconnect: RetryPolicy::default(),
        }
    }

    pub fn with_keep_alive(mut self, interval: Duration, tolerance: u64) -> Self {
        self.keep_alive_interval = interval;
        self.keep_alive_tolerance = tolerance;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    pub fn with_transmission_timeout(mut self, timeout: Duration) -> Self {
        self.transmission_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("address", &self.address)
            .field("password", &"<redacted>")
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("keep_alive_tolerance", &self.keep_alive_tolerance)
            .field("login_timeout", &self.login_timeout)
            .field("transmission_timeout", &self.transmission_timeout)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}
