use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::LayerPaths;
use crate::error::OverlayError;

/// Retail paths the dedicated server actually reads. Everything else in the
/// game installation stays untouched.
const GAME_LINKS: &[&str] = &["bin/x64_retail", "vpk", "r2", "build.txt", "server.dll"];

/// Config file executed by the server at startup; replaced with a real file
/// so the configuration merger can write into it.
const SERVER_AUTOEXEC: &str = "mods/Base.DedicatedServer/cfg/autoexec_server.cfg";

/// The server opens this one read/write, so it must be a copy, not a link.
const PLAYERDATA_PLACEHOLDER: &str = "placeholder_playerdata.dat";

/// Runtime files that must never shadow the game layer or are client-only.
const RUNTIME_SKIP: &[&str] = &[
    "bin/x64_retail",
    "bin/x64_retail/wsock32.dll",
    "launcher_rpc.dll",
];

/// A disposable working directory assembled by symlinking the source layers
/// together. The directory is not removed on drop; callers decide when the
/// run is over.
#[derive(Debug)]
pub struct Overlay {
    path: PathBuf,
}

impl Overlay {
    /// Assemble a new overlay under `staging_dir`. On any failure the
    /// partially-built directory is removed.
    pub fn build(staging_dir: &Path, layers: &LayerPaths) -> Result<Overlay, OverlayError> {
        let path = staging_dir.join(format!("gs-{}", Uuid::new_v4()));
        fs::create_dir_all(&path).map_err(|source| OverlayError::Staging {
            dir: staging_dir.to_path_buf(),
            source,
        })?;

        let overlay = Overlay { path };
        tracing::debug!(path = ?overlay.path, "assembling overlay");

        if let Err(err) = overlay.assemble(layers) {
            let _ = overlay.remove();
            return Err(err);
        }

        tracing::info!(path = ?overlay.path, "overlay ready");
        Ok(overlay)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Executable name, relative to the overlay root.
    pub fn executable(&self) -> &'static str {
        "GameServer.exe"
    }

    /// Location of the startup config inside the overlay.
    pub fn autoexec_path(&self) -> PathBuf {
        self.path.join(SERVER_AUTOEXEC)
    }

    /// Delete the overlay tree. Only the links are removed; the source
    /// layers are never followed.
    pub fn remove(&self) -> Result<(), OverlayError> {
        fs::remove_dir_all(&self.path)?;
        Ok(())
    }

    fn assemble(&self, layers: &LayerPaths) -> Result<(), OverlayError> {
        self.merge_game(&layers.game)?;
        self.merge_runtime(&layers.runtime)?;
        self.merge_mods(&layers.mods)?;
        self.merge_plugins(&layers.plugins)?;
        self.merge_save_data(&layers.save_data)?;
        Ok(())
    }

    fn merge_game(&self, src: &Path) -> Result<(), OverlayError> {
        for rel in GAME_LINKS {
            let dest = self.path.join(rel);
            if let Some(parent) = dest.parent()
                && parent != self.path.as_path()
            {
                fs::create_dir_all(parent)?;
            }
            checked_symlink(&src.join(rel), &dest, false)?;
        }
        Ok(())
    }

    fn merge_runtime(&self, src: &Path) -> Result<(), OverlayError> {
        // Older runtime builds shipped without these; refuse early with a
        // useful message instead of failing at launch.
        for (rel, what) in [
            (SERVER_AUTOEXEC, "server autoexec"),
            ("bin/x64_dedi/d3d11.dll", "dedicated render stub"),
            ("mods/Base.DedicatedServer/maps/navmesh", "nav meshes"),
            ("mods/Base.DedicatedServer/maps/graphs", "nav graphs"),
        ] {
            if fs::metadata(src.join(rel)).is_err() {
                return Err(OverlayError::RuntimeIncomplete(format!("{what} ({rel})")));
            }
        }

        // The server wants to write into its own directory, and some of it
        // misbehaves when the directory itself is a symlink, so the tree is
        // recreated with per-file links.
        self.walk_runtime(src, src)
    }

    fn walk_runtime(&self, root: &Path, dir: &Path) -> Result<(), OverlayError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let rel = path
                .strip_prefix(root)
                .map_err(|_| io::Error::other("runtime entry outside layer root"))?;
            let rel_str = rel.to_string_lossy();
            let dest = self.path.join(rel);

            if RUNTIME_SKIP.contains(&rel_str.as_ref()) {
                continue;
            }
            if rel_str == SERVER_AUTOEXEC {
                fs::write(&dest, b"")?;
                continue;
            }
            if rel_str == PLAYERDATA_PLACEHOLDER {
                fs::copy(&path, &dest)?;
                continue;
            }

            if entry.file_type()?.is_dir() {
                fs::create_dir_all(&dest)?;
                self.walk_runtime(root, &path)?;
            } else {
                checked_symlink(&path, &dest, false)?;
            }
        }
        Ok(())
    }

    fn merge_mods(&self, src: &Path) -> Result<(), OverlayError> {
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let name = entry.file_name();
            let dest = self.path.join("mods").join(&name);
            if fs::metadata(&dest).is_ok() {
                return Err(OverlayError::ModConflict(name.to_string_lossy().into_owned()));
            }
            checked_symlink(&entry.path(), &dest, false)?;
        }
        Ok(())
    }

    fn merge_plugins(&self, src: &Path) -> Result<(), OverlayError> {
        fs::create_dir_all(self.path.join("plugins"))?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            let is_dll = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"));
            if is_dll {
                checked_symlink(&path, &self.path.join("plugins").join(entry.file_name()), true)?;
            }
        }
        Ok(())
    }

    fn merge_save_data(&self, src: &Path) -> Result<(), OverlayError> {
        match checked_symlink(src, &self.path.join("save_data"), true) {
            Err(OverlayError::SourceMissing { .. }) => Ok(()),
            other => other,
        }
    }
}

/// Symlink `src` to `dst` after confirming the source exists, so a broken
/// layer surfaces here instead of as an obscure launch failure.
fn checked_symlink(src: &Path, dst: &Path, replace: bool) -> Result<(), OverlayError> {
    if let Err(source) = fs::metadata(src) {
        return Err(OverlayError::SourceMissing {
            path: src.to_path_buf(),
            source,
        });
    }
    if replace && let Ok(meta) = fs::symlink_metadata(dst) {
        if meta.is_dir() {
            fs::remove_dir_all(dst)?;
        } else {
            fs::remove_file(dst)?;
        }
    }
    std::os::unix::fs::symlink(src, dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"x").unwrap();
    }

    fn fixture_layers(root: &Path) -> LayerPaths {
        let game = root.join("game");
        fs::create_dir_all(game.join("bin/x64_retail")).unwrap();
        fs::create_dir_all(game.join("vpk")).unwrap();
        fs::create_dir_all(game.join("r2")).unwrap();
        touch(&game.join("build.txt"));
        touch(&game.join("server.dll"));

        let runtime = root.join("runtime");
        touch(&runtime.join(SERVER_AUTOEXEC));
        touch(&runtime.join("bin/x64_dedi/d3d11.dll"));
        fs::create_dir_all(runtime.join("mods/Base.DedicatedServer/maps/navmesh")).unwrap();
        fs::create_dir_all(runtime.join("mods/Base.DedicatedServer/maps/graphs")).unwrap();
        touch(&runtime.join(PLAYERDATA_PLACEHOLDER));

        let mods = root.join("mods");
        fs::create_dir_all(&mods).unwrap();
        let plugins = root.join("plugins");
        fs::create_dir_all(&plugins).unwrap();

        LayerPaths {
            game,
            runtime,
            mods,
            plugins,
            save_data: root.join("save-data"),
        }
    }

    #[test]
    fn builds_overlay_from_complete_layers() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = fixture_layers(tmp.path());

        let overlay = Overlay::build(tmp.path(), &layers).unwrap();

        let game_link = overlay.path().join("server.dll");
        assert!(fs::symlink_metadata(&game_link).unwrap().is_symlink());
        assert_eq!(fs::read_link(&game_link).unwrap(), layers.game.join("server.dll"));

        // The autoexec is a real, empty file, ready to be written.
        let autoexec = overlay.autoexec_path();
        assert!(fs::symlink_metadata(&autoexec).unwrap().is_file());
        assert_eq!(fs::read(&autoexec).unwrap(), b"");

        // The placeholder is a copy, not a link.
        let placeholder = overlay.path().join(PLAYERDATA_PLACEHOLDER);
        assert!(fs::symlink_metadata(&placeholder).unwrap().is_file());

        overlay.remove().unwrap();
        assert!(!overlay.path().exists());
        // Source layers survive overlay removal.
        assert!(layers.runtime.join(SERVER_AUTOEXEC).exists());
    }

    #[test]
    fn missing_save_data_is_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = fixture_layers(tmp.path());
        assert!(!layers.save_data.exists());

        let overlay = Overlay::build(tmp.path(), &layers).unwrap();
        assert!(!overlay.path().join("save_data").exists());
    }

    #[test]
    fn save_data_is_linked_when_present() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = fixture_layers(tmp.path());
        fs::create_dir_all(&layers.save_data).unwrap();

        let overlay = Overlay::build(tmp.path(), &layers).unwrap();
        assert!(fs::symlink_metadata(overlay.path().join("save_data")).unwrap().is_symlink());
    }

    #[test]
    fn incomplete_runtime_is_rejected_and_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = fixture_layers(tmp.path());
        fs::remove_file(layers.runtime.join("bin/x64_dedi/d3d11.dll")).unwrap();

        let err = Overlay::build(tmp.path(), &layers).unwrap_err();
        assert!(matches!(err, OverlayError::RuntimeIncomplete(_)));

        // No half-built gs-* directory left behind.
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("gs-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn extra_mod_may_not_shadow_builtin() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = fixture_layers(tmp.path());
        fs::create_dir_all(layers.mods.join("Base.DedicatedServer")).unwrap();

        let err = Overlay::build(tmp.path(), &layers).unwrap_err();
        assert!(matches!(err, OverlayError::ModConflict(name) if name == "Base.DedicatedServer"));
    }

    #[test]
    fn only_dlls_are_taken_from_the_plugins_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let layers = fixture_layers(tmp.path());
        touch(&layers.plugins.join("Extra.dll"));
        touch(&layers.plugins.join("README.md"));

        let overlay = Overlay::build(tmp.path(), &layers).unwrap();
        assert!(overlay.path().join("plugins/Extra.dll").exists());
        assert!(!overlay.path().join("plugins/README.md").exists());
    }
}
