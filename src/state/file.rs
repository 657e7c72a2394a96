use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ClusterState, StateError};

pub const STATE_FILE_EXTENSION: &str = "rkestate";

/// `cluster.yml` -> `cluster.rkestate`, next to the cluster file.
pub fn state_file_path(config_path: &Path) -> PathBuf {
    config_path.with_extension(STATE_FILE_EXTENSION)
}

/// Reads the local state file; a missing file is not an error.
pub fn read_state_file(path: &Path) -> Result<Option<ClusterState>, StateError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state = serde_json::from_str(&content)
        .map_err(|e| StateError::Serialization(format!("{}: {}", path.display(), e)))?;
    debug!("[state] Loaded local state file {}", path.display());
    Ok(Some(state))
}

/// Writes the state file atomically, readable only by the owner.
pub fn write_state_file(path: &Path, state: &ClusterState) -> Result<(), StateError> {
    let content = serde_json::to_string_pretty(state)
        .map_err(|e| StateError::Serialization(e.to_string()))?;

    let tmp = path.with_extension(format!("{}.tmp", STATE_FILE_EXTENSION));
    fs::write(&tmp, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)?;

    debug!("[state] Wrote local state file {}", path.display());
    Ok(())
}
