use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::DiscoveryInfo;

/// Per-user runtime directory holding the discovery file.
pub fn runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("termdeck")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/termdeck-{uid}"))
    }
}

/// Well-known location where the daemon announces `{pid, port}`.
pub fn discovery_file_path() -> PathBuf {
    runtime_dir().join("daemon.json")
}

/// Returns the data directory for server-side state (the terminal store).
pub fn data_dir() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_home).join("termdeck")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local").join("share").join("termdeck")
    } else {
        PathBuf::from("/tmp/termdeck")
    }
}

/// Write the discovery file, replacing any stale one. The write goes through
/// a temp file and a rename so readers never observe a half-written record.
pub fn write_discovery(path: &Path, info: &DiscoveryInfo) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
        }
    }
    let json = serde_json::to_vec(info).map_err(io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

/// Read the discovery file. `Ok(None)` when it does not exist.
pub fn read_discovery(path: &Path) -> io::Result<Option<DiscoveryInfo>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove the discovery file; a missing file is not an error.
pub fn remove_discovery(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
