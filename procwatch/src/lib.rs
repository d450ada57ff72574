//! # Server Process Supervision
//!
//! Keeps a dedicated game server process alive and drives periodic admin
//! work against it.
//!
//! ## Modules
//!
//! ### Watcher (`watcher`)
//! Starts the server executable from its own directory, exposes its
//! stdout/stderr as line channels and restarts it when it exits or when a
//! restart is requested. Restart pacing uses [`shared::RetryPolicy`].
//!
//! ### Schedule (`schedule`)
//! Loads a JSON list of jobs and runs each on its own interval. Command jobs
//! feed a bounded queue that the RCON side drains; restart jobs go through a
//! [`RestartHandle`].
//!
//! Both halves stop when the shared `watch::Sender<bool>` shutdown flag is
//! raised.

pub mod error;
pub mod schedule;
pub mod watcher;

pub use error::WatchError;
pub use schedule::{Job, Schedule, Scheduler};
pub use watcher::{RestartHandle, Watcher, WatcherConfig, WatcherOutput};

use tokio::sync::watch;

pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
