//! Filesystem layout under the user's config directory.
//!
//! - Linux:   `~/.config/murmure/`
//! - macOS:   `~/Library/Application Support/org.murmure.murmure/`
//! - Windows: `{FOLDERID_RoamingAppData}\murmure\murmure\config\`

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::error::{Result, StoreError};

pub const IDENTITY_FILE: &str = "identity";
pub const CONFIG_FILE: &str = "config.json";
pub const PEERS_FILE: &str = "peers.json";
pub const HISTORY_FILE: &str = "call_history.json";

/// Resolve (and create) the application config directory.
pub fn config_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("org", "murmure", "murmure").ok_or(StoreError::NoDataDir)?;
    let dir = dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Write `contents` to `path` through a temp file and atomic rename, so a
/// crash mid-write can never leave a torn file behind.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.json");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());
    }
}
