//! Install markers for pack directories
//!
//! Each pack lives in `<root>/<name>.<hash>/`. Two zero-byte markers record
//! its durable state:
//!
//! - `@VALID`: the pack content is complete and flushed
//! - `@ENABLED`: this pack is allowed to run
//!
//! The markers are the only install state a booter reads, and every operation
//! here is idempotent: replaying it after a power cut ends in the same marker
//! set.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cache::sync_dir;
use crate::error::{Error, Result};
use crate::index::PackIndex;
use crate::resolver::{is_valid_hash, parse_version};

/// Marker for a completely unpacked pack
pub const VALID_MARKER: &str = "@VALID";
/// Marker for a pack that should run
pub const ENABLED_MARKER: &str = "@ENABLED";

/// A pack directory found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPack {
    /// Directory name, `<name>.<hash>`
    pub dir_name: String,
    /// Numeric version parsed from the name
    pub version: u64,
    /// `@ENABLED` present
    pub enabled: bool,
}

/// Marker-file protocol over the pack directories under a root
#[derive(Debug, Clone)]
pub struct InstallManager {
    root: PathBuf,
}

impl InstallManager {
    /// Manage the pack directories directly under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root the pack directories live in
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path of a pack directory
    pub fn pack_path(&self, install_dir: &str) -> PathBuf {
        self.root.join(install_dir)
    }

    /// Whether `install_dir` carries `@VALID`
    pub fn is_installed(&self, install_dir: &str) -> bool {
        self.pack_path(install_dir).join(VALID_MARKER).is_file()
    }

    /// Mark a fully unpacked directory valid
    ///
    /// Must only be called after the unpacker reported Done for this
    /// directory; this is the last write of the install sequence.
    pub fn finalize_install(&self, install_dir: &str) -> Result<()> {
        let dir = self.pack_path(install_dir);
        write_marker(&dir, VALID_MARKER)?;
        // The pack directory's own entry in the root
        sync_dir(&self.root)?;
        info!(pack = install_dir, "pack marked valid");
        Ok(())
    }

    /// Make `@ENABLED` match the index for every indexed pack present on disk
    ///
    /// Directories absent from the index are left untouched, and so are
    /// entries whose `<name>.<hash>` is not a single plain directory name.
    pub fn apply_enabled_flags(&self, index: &PackIndex) -> Result<()> {
        for entry in index.entries.values() {
            let install_dir = entry.install_dir();
            if !is_pack_dir_name(&install_dir) || !is_valid_hash(&entry.hash) {
                warn!(
                    pack = %entry.name,
                    install_dir = %install_dir,
                    "refusing unsafe pack directory name"
                );
                continue;
            }
            let dir = self.pack_path(&install_dir);
            if !dir.is_dir() {
                continue;
            }

            remove_marker(&dir, ENABLED_MARKER)?;
            if entry.enabled {
                write_marker(&dir, ENABLED_MARKER)?;
                info!(pack = %install_dir, "enabled");
            } else {
                info!(pack = %install_dir, "disabled");
            }
        }
        Ok(())
    }

    /// Pack directories on disk that carry `@VALID`, lowest version first
    pub fn installed_versions(&self) -> Result<Vec<InstalledPack>> {
        let mut packs = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(packs),
            Err(e) => return Err(Error::Io(e)),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((name, hash)) = dir_name.split_once('.') else {
                continue;
            };
            let Some(version) = parse_version(name) else {
                continue;
            };
            if hash.is_empty() || !path.join(VALID_MARKER).is_file() {
                continue;
            }
            packs.push(InstalledPack {
                dir_name: dir_name.to_string(),
                version,
                enabled: path.join(ENABLED_MARKER).is_file(),
            });
        }

        packs.sort_by(|a, b| a.version.cmp(&b.version).then(a.dir_name.cmp(&b.dir_name)));
        Ok(packs)
    }

    /// The pack a booter would run: highest version that is valid and enabled
    pub fn boot_candidate(&self) -> Result<Option<InstalledPack>> {
        Ok(self
            .installed_versions()?
            .into_iter()
            .rev()
            .find(|pack| pack.enabled))
    }
}

/// A single normal path component, so joining it stays under the root
fn is_pack_dir_name(name: &str) -> bool {
    if name.contains(['/', '\\', '\0', ':']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn write_marker(dir: &Path, marker: &'static str) -> Result<()> {
    let path = dir.join(marker);
    let file = File::create(&path).map_err(|source| Error::Marker {
        marker,
        dir: dir.to_path_buf(),
        source,
    })?;
    file.sync_all().map_err(|source| Error::Marker {
        marker,
        dir: dir.to_path_buf(),
        source,
    })?;
    drop(file);
    sync_dir(dir).map_err(|source| Error::Marker {
        marker,
        dir: dir.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "marker written");
    Ok(())
}

fn remove_marker(dir: &Path, marker: &'static str) -> Result<()> {
    match std::fs::remove_file(dir.join(marker)) {
        Ok(()) => sync_dir(dir).map_err(|source| Error::Marker {
            marker,
            dir: dir.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::Marker {
            marker,
            dir: dir.to_path_buf(),
            source,
        }),
    }
}
