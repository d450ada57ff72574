use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to start {executable:?}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid schedule: {0}")]
    Schedule(#[from] serde_json::Error),

    #[error("no process is being supervised")]
    NotRunning,
}
