use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("create staging directory in {dir:?}: {source}")]
    Staging {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("access {path:?}: {source}")]
    SourceMissing {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("runtime build incomplete: missing {0}")]
    RuntimeIncomplete(String),

    #[error("not allowed to override built-in mod {0}")]
    ModConflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
