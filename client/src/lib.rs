//! # RCON Client Library
//!
//! This library implements the client side of the BattlEye remote console
//! protocol: a UDP control channel used to administer a running game server
//! (kick players, lock the server, broadcast messages, read chat and events).
//!
//! ## Architecture Overview
//!
//! The protocol is datagram based and unreliable. The client owns everything
//! that makes it usable anyway:
//!
//! ### Request Correlation
//! Every command goes out under an 8-bit sequence number and is registered in
//! a transmission table before it is sent. The server acknowledges each
//! command under the same number, possibly spread over several packets, and
//! the read loop hands the reassembled response to the command's sink.
//!
//! ### Liveness
//! When no command was sent during a keepalive interval the client sends an
//! empty command. Any acknowledgement from the server resets the unanswered
//! keepalive counter. Once too many keepalives go unanswered, the link is
//! treated as dead.
//!
//! ### Reconnection
//! A dead link is torn down, every outstanding command is dropped and the
//! client logs in again after a backoff delay. Rejected credentials stop the
//! retries instead of looping on them.
//!
//! ## Module Organization
//!
//! ### Connection Module (`connection`)
//! One connected UDP socket plus its counters:
//! - Serialized datagram sends
//! - Receives with optional deadlines
//! - Login handshake
//! - Sequence, keepalive and pingback counters
//!
//! ### Transmission Module (`transmission`)
//! Outstanding commands keyed by sequence number, with index-based
//! reassembly of multipart responses and time-boxed eviction.
//!
//! ### Session Module (`session`)
//! The supervised link: login, read loop, keepalive ticker, reconnect
//! policy, and routing of server messages to chat and event sinks.
//!
//! ### Sink Module (`sink`)
//! Where responses and broadcasts are delivered: channels or closures.
//!
//! ### Settings Module (`settings`)
//! The JSON configuration file of the `client` binary.
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::sink::shared;
//! use client::{ClientConfig, Session};
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> Result<(), client::SessionError> {
//! let address = "127.0.0.1:2302".parse().expect("valid address");
//! let session = Session::new(ClientConfig::new(address, "secret"));
//! session.watcher_loop().await?;
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! session.run_command("players", Some(shared(tx))).await?;
//! if let Some(players) = rx.recv().await {
//!     println!("{}", players);
//! }
//!
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod session;
pub mod settings;
pub mod sink;
pub mod transmission;

pub use config::ClientConfig;
pub use connection::Connection;
pub use error::{SessionError, TableError};
pub use session::{Session, SessionState};
pub use sink::{FnSink, SharedSink, Sink};
pub use transmission::{Transmission, TransmissionTable};
