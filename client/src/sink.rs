//! Destinations for command responses and server broadcasts

use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Receives fully assembled messages from the read loop
///
/// `deliver` is called from the session's read task and must not block.
pub trait Sink: Send + Sync {
    fn deliver(&self, message: String);
}

pub type SharedSink = Arc<dyn Sink>;

/// Wraps any sink into the shared form the session stores.
pub fn shared<S: Sink + 'static>(sink: S) -> SharedSink {
    Arc::new(sink)
}

impl Sink for mpsc::UnboundedSender<String> {
    fn deliver(&self, message: String) {
        if self.send(message).is_err() {
            debug!("Sink receiver dropped, discarding message");
        }
    }
}

impl Sink for mpsc::Sender<String> {
    fn deliver(&self, message: String) {
        match self.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!("Sink is full, dropping message: {}", message);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Sink receiver dropped, discarding message");
            }
        }
    }
}

/// Adapts a closure into a [`Sink`]
pub struct FnSink<F>(pub F);

impl<F> Sink for FnSink<F>
where
    F: Fn(String) + Send + Sync,
{
    fn deliver(&self, message: String) {
        (self.0)(message)
    }
}
