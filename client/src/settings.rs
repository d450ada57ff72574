//! JSON configuration of the admin tool
//!
//! ```json
//! {
//!   "arma": {
//!     "enabled": true, "ip": "127.0.0.1", "port": 2302, "password": "secret",
//!     "keepAliveTimer": 30, "keepAliveTolerance": 3,
//!     "showChat": true, "showEvents": true
//!   },
//!   "watcher": {
//!     "enabled": true, "path": "/opt/arma3/arma3server", "params": ["-port=2302"],
//!     "logToConsole": true, "logToFile": false, "logFolder": "logs"
//!   },
//!   "scheduler": { "enabled": true, "path": "scheduler.json" }
//! }
//! ```
//!
//! Every key is optional; missing ones take the defaults below.

use crate::config::{ClientConfig, DEFAULT_LOGIN_TIMEOUT, DEFAULT_TRANSMISSION_TIMEOUT};
use procwatch::WatcherConfig;
use serde::{Deserialize, Serialize};
use shared::RetryPolicy;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot resolve RCON address {0}")]
    Address(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub arma: RconSettings,
    pub watcher: WatcherSettings,
    pub scheduler: SchedulerSettings,
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RconSettings {
    pub enabled: bool,
    pub ip: String,
    pub port: u16,
    pub password: String,
    /// Seconds between keepalives
    pub keep_alive_timer: u64,
    pub keep_alive_tolerance: u64,
    pub login_timeout_ms: u64,
    /// Seconds an unanswered command is kept
    pub transmission_timeout: u64,
    pub show_chat: bool,
    pub show_events: bool,
    pub reconnect: RetryPolicy,
}

impl Default for RconSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ip: "127.0.0.1".to_string(),
            port: 2302,
            password: String::new(),
            keep_alive_timer: 30,
            keep_alive_tolerance: 3,
            login_timeout_ms: DEFAULT_LOGIN_TIMEOUT.as_millis() as u64,
            transmission_timeout: DEFAULT_TRANSMISSION_TIMEOUT.as_secs(),
            show_chat: true,
            show_events: true,
            reconnect: RetryPolicy::default(),
        }
    }
}

impl RconSettings {
    /// Resolves `ip:port`, accepting host names as well.
    pub fn address(&self) -> Result<SocketAddr, SettingsError> {
        let target = format!("{}:{}", self.ip, self.port);
        (self.ip.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| SettingsError::Address(target.clone()))?
            .next()
            .ok_or(SettingsError::Address(target))
    }

    /// Overrides ip and port from an `ip:port` string.
    pub fn set_address(&mut self, address: &str) -> Result<(), SettingsError> {
        let parsed: SocketAddr = address
            .parse()
            .map_err(|_| SettingsError::Address(address.to_string()))?;
        self.ip = parsed.ip().to_string();
        self.port = parsed.port();
        Ok(())
    }

    pub fn client_config(&self) -> Result<ClientConfig, SettingsError> {
        Ok(ClientConfig::new(self.address()?, self.password.clone())
            .with_keep_alive(
                Duration::from_secs(self.keep_alive_timer.max(1)),
                self.keep_alive_tolerance,
            )
            .with_login_timeout(Duration::from_millis(self.login_timeout_ms))
            .with_transmission_timeout(Duration::from_secs(self.transmission_timeout))
            .with_reconnect(self.reconnect.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatcherSettings {
    pub enabled: bool,
    pub path: PathBuf,
    pub params: Vec<String>,
    pub log_to_console: bool,
    pub log_to_file: bool,
    pub log_folder: PathBuf,
    pub restart: RetryPolicy,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
            params: Vec::new(),
            log_to_console: true,
            log_to_file: false,
            log_folder: PathBuf::from("logs"),
            restart: RetryPolicy::fixed(Duration::from_secs(5)),
        }
    }
}

impl WatcherSettings {
    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig::new(&self.path)
            .with_params(self.params.iter().cloned())
            .with_restart(self.restart.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("scheduler.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_json(
            r#"{
                "arma": {
                    "enabled": true, "ip": "127.0.0.1", "port": 2310, "password": "pw",
                    "keepAliveTimer": 10, "keepAliveTolerance": 5,
                    "showChat": false, "showEvents": true
                },
                "watcher": {
                    "enabled": true, "path": "/opt/arma3/arma3server",
                    "params": ["-port=2310", "-config=server.cfg"],
                    "logToConsole": false, "logToFile": true, "logFolder": "/var/log/arma"
                },
                "scheduler": { "enabled": true, "path": "jobs.json" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.arma.port, 2310);
        assert!(!config.arma.show_chat);
        assert!(config.watcher.log_to_file);
        assert_eq!(config.watcher.params.len(), 2);
        assert_eq!(config.scheduler.path, PathBuf::from("jobs.json"));

        let client = config.arma.client_config().unwrap();
        assert_eq!(client.address, "127.0.0.1:2310".parse::<SocketAddr>().unwrap());
        assert_eq!(client.keep_alive_interval, Duration::from_secs(10));
        assert_eq!(client.keep_alive_tolerance, 5);
        assert_eq!(client.password, "pw");

        let watcher = config.watcher.watcher_config();
        assert_eq!(watcher.executable, PathBuf::from("/opt/arma3/arma3server"));
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert!(config.arma.enabled);
        assert!(!config.watcher.enabled);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.arma.address().unwrap().port(), 2302);
        assert_eq!(
            config.arma.client_config().unwrap().login_timeout,
            DEFAULT_LOGIN_TIMEOUT
        );
    }

    #[test]
    fn test_address_override() {
        let mut settings = RconSettings::default();
        settings.set_address("10.1.2.3:2402").unwrap();
        assert_eq!(settings.ip, "10.1.2.3");
        assert_eq!(settings.port, 2402);
        assert!(matches!(
            settings.set_address("not an address"),
            Err(SettingsError::Address(_))
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            AppConfig::from_json("{ \"arma\": 5 }"),
            Err(SettingsError::Parse(_))
        ));
    }
}
