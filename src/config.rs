use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tracing::{debug, warn};

use crate::error::Result;

/// Ancestor file naming the index directory for a working tree. Kept
/// compatible with the original tool so existing setups keep working.
pub const ROOT_DISCOVERY_FILE: &str = ".pyeverything";

/// Resolve the index directory: an explicit `-l` wins, then a
/// `.pyeverything` file in an ancestor of `cwd`, then the per-user default.
pub fn resolve_index_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_owned());
    }
    let cwd = std::env::current_dir()?;
    if let Some(found) = discover_index_dir(&cwd) {
        debug!(?found, "index directory from {ROOT_DISCOVERY_FILE}");
        return Ok(found);
    }
    default_index_dir()
}

/// Walk `start` and its ancestors looking for [`ROOT_DISCOVERY_FILE`]; its
/// contents, trimmed of CR/LF, name the index directory.
pub fn discover_index_dir(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let marker = dir.join(ROOT_DISCOVERY_FILE);
        if !marker.is_file() {
            continue;
        }
        match std::fs::read_to_string(&marker) {
            Ok(contents) => {
                let trimmed = contents.trim_matches(|c| c == '\r' || c == '\n');
                if !trimmed.is_empty() {
                    return Some(PathBuf::from(trimmed));
                }
                warn!(?marker, "empty root-discovery file; ignoring");
            }
            Err(err) => warn!(%err, ?marker, "unreadable root-discovery file; ignoring"),
        }
    }
    None
}

/// Per-user config directory + `/cache`, created by the store on open.
pub fn default_index_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "angsto-tech", "pyeverything").ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no home directory for the default index location",
        )
    })?;
    Ok(dirs.config_dir().join("cache"))
}
