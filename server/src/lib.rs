//! # Simulated RCON Server
//!
//! A stand-in for the RCON side of a game server, used for local development
//! and by the end-to-end tests of the client.
//!
//! ## What it does
//!
//! ### Login
//! Compares the login payload with the configured password and answers with
//! the success or failure byte. The address that logged in last becomes the
//! client; commands from anyone else are ignored.
//!
//! ### Commands
//! Every command is acknowledged under its own sequence number. An empty
//! command is a keepalive and gets an empty acknowledgement. `players`
//! returns a long canned listing; anything else is echoed back. Responses
//! longer than the configured payload limit go out as multipart packets.
//!
//! ### Server messages
//! [`Responder::broadcast`] pushes a message to the client with the
//! responder's own sequence counter and records the acks that come back.
//!
//! ### Misbehaviour
//! [`Behavior`] makes the responder silent, reject every login, or go quiet
//! right after a successful login, which is what a crashed or frozen game
//! server looks like from the client's side.

pub mod responder;

pub use responder::{Behavior, Responder, ResponderConfig, ResponderError, ResponderStats};
