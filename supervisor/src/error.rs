use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("cannot re-use an instance")]
    AlreadyUsed,

    #[error("instance was never started")]
    NeverStarted,

    #[error("failed to allocate pty: {0}")]
    Pty(#[from] nix::errno::Errno),

    #[error("failed to start virtual display: {0}")]
    DisplayStart(std::io::Error),

    #[error("virtual display exited prematurely: {0}")]
    DisplayExited(String),

    #[error("failed to start game ({dir:?}, {executable:?}, {args:?}): {source}")]
    GameStart {
        dir: PathBuf,
        executable: String,
        args: Vec<String>,
        source: std::io::Error,
    },

    #[error("server exited: {0}")]
    Exited(String),

    #[error("server terminated")]
    Terminated,

    #[error("run cancelled")]
    Cancelled,

    #[error("watchdog did not receive a title update in time (last update {since_last:?} ago)")]
    WatchdogTimeout { since_last: Duration },

    #[error("instance did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
