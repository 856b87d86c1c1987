mod error;
mod stage;

use std::path::PathBuf;

pub use error::OverlayError;
pub use stage::Overlay;

/// Read-only source layers merged into one disposable working directory.
#[derive(Debug, Clone)]
pub struct LayerPaths {
    /// Retail game installation (only a fixed allow-list of paths is used).
    pub game: PathBuf,
    /// Dedicated-server runtime build (mod loader, stubs, nav data).
    pub runtime: PathBuf,
    /// Extra mods, one directory per mod.
    pub mods: PathBuf,
    /// Plugin DLLs.
    pub plugins: PathBuf,
    /// Persistent save data; may not exist.
    pub save_data: PathBuf,
}
