use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    store::{secs_from_datetime, unix_secs, WriteSession},
    walker::walk_directory,
};

/// What one reconcile pass did. `changed()` feeds the task's
/// index-updated flag.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ReconcileStats {
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.deleted > 0
    }
}

/// Bring the index in line with the on-disk tree under `root`: sweep
/// documents whose file vanished, add new files, re-add modified ones, and
/// refresh the root marker. All mutations land in the caller's session, so
/// the whole reconcile commits or rolls back as one unit.
pub fn reconcile(session: &WriteSession<'_>, root: &Path) -> Result<ReconcileStats> {
    let marker_mtime = session
        .store()
        .root_mtime(root)?
        .map(secs_from_datetime);

    let (exist_stored, deleted) = clear_non_exist(session, root)?;
    let mut stats = ReconcileStats {
        deleted,
        ..Default::default()
    };

    for file in walk_directory(root) {
        let mtime = match std::fs::metadata(&file).and_then(|m| m.modified()) {
            Ok(t) => unix_secs(t),
            Err(err) => {
                warn!(%err, ?file, "unable to stat; skipping");
                continue;
            }
        };

        let decision = match exist_stored.get(&file) {
            None => Some(&mut stats.added),
            Some(&stored_mtime) if mtime > stored_mtime => Some(&mut stats.updated),
            // The marker only advances on a successful full reconcile, so a
            // file touched since then is re-read even when the stored mtime
            // looks current.
            _ if marker_mtime.map_or(true, |m| mtime > m) => Some(&mut stats.updated),
            _ => None,
        };

        match decision {
            Some(counter) => {
                debug!(?file, "indexing document");
                if let Err(err) = session.add_file_document(&file) {
                    warn!(%err, ?file, "indexing failed; skipping");
                } else {
                    *counter += 1;
                }
            }
            None => debug!(?file, "unchanged since last reconcile; skipping"),
        }
    }

    session.touch_root(root, Utc::now())?;

    info!(
        ?root,
        added = stats.added,
        updated = stats.updated,
        deleted = stats.deleted,
        "reconcile finished"
    );
    Ok(stats)
}

/// Sweep stored documents under `root` whose file no longer exists.
/// Returns the survivors as `path → stored mtime` plus the delete count.
fn clear_non_exist(
    session: &WriteSession<'_>,
    root: &Path,
) -> Result<(HashMap<PathBuf, u64>, usize)> {
    let stored = session.store().stored_under(root)?;

    let mut exist_files = HashMap::with_capacity(stored.len());
    let mut deleted = 0;
    for (path, mtime) in stored {
        if path.exists() {
            exist_files.insert(path, mtime);
        } else {
            debug!(?path, "file gone; deleting document");
            session.delete_by_path(&path);
            deleted += 1;
        }
    }
    Ok((exist_files, deleted))
}
