use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WineError {
    #[error("wineboot failed: {0}")]
    Boot(String),

    #[error("registry update failed for {key}: {reason}")]
    Registry { key: String, reason: String },

    #[error("wine processes did not exit within {0:?}")]
    WaitTimeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
