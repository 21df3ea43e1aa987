use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

/// Names pruned unconditionally, before any ignore file is consulted.
static BUILTIN_IGNORE: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from([".git", ".svn", "CVS", ".hg", ".gitignore"]));

/// Ignore files honored in each directory, nearest first.
const IGNORE_PATTERN_FILES: &[&str] = &[".ignore", ".gitignore", ".git/info/exclude", ".hgignore"];

/// Per-directory ignore rules chained to the parent directory's. A child's
/// verdict wins over an ancestor's, matching gitignore precedence. The
/// chain only lives on the walk's queue, so it stays a tree.
struct IgnoreChain {
    matcher: Option<Gitignore>,
    parent: Option<Arc<IgnoreChain>>,
}

impl IgnoreChain {
    fn for_dir(dir: &Path, parent: Option<Arc<IgnoreChain>>) -> Arc<IgnoreChain> {
        let mut builder = GitignoreBuilder::new(dir);
        let mut found = false;
        for name in IGNORE_PATTERN_FILES {
            let file = dir.join(name);
            if file.is_file() {
                if let Some(err) = builder.add(&file) {
                    warn!(%err, ?file, "bad ignore file; skipping it");
                } else {
                    found = true;
                }
            }
        }

        let matcher = if found {
            match builder.build() {
                Ok(matcher) => Some(matcher),
                Err(err) => {
                    warn!(%err, ?dir, "unable to build ignore rules for directory");
                    None
                }
            }
        } else {
            None
        };

        Arc::new(IgnoreChain { matcher, parent })
    }

    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        if let Some(matcher) = &self.matcher {
            match matcher.matched(path, is_dir) {
                Match::Ignore(_) => return true,
                Match::Whitelist(_) => return false,
                Match::None => {}
            }
        }
        match &self.parent {
            Some(parent) => parent.is_ignored(path, is_dir),
            None => false,
        }
    }
}

/// Breadth-first listing of the indexable files under `root`. Hidden files
/// are yielded unless an ignore rule says otherwise; symlinks are followed
/// only when they point at a non-directory, so the walk cannot cycle.
/// Unreadable directories are logged and skipped.
pub fn walk_directory(root: &Path) -> Vec<PathBuf> {
    let mut files = vec![];
    let mut queue = VecDeque::new();
    queue.push_back((root.to_owned(), IgnoreChain::for_dir(root, None)));

    while let Some((dir, chain)) = queue.pop_front() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, ?dir, "unable to read directory; skipping");
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%err, ?dir, "unreadable directory entry; skipping");
                    continue;
                }
            };
            let path = entry.path();
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if BUILTIN_IGNORE.contains(name) {
                    continue;
                }
            }

            let Ok(file_type) = entry.file_type() else {
                debug!(?path, "no file type; skipping");
                continue;
            };

            // Resolve symlinks to their target kind; directory targets are
            // not descended into.
            let (is_file, is_dir) = if file_type.is_symlink() {
                match std::fs::metadata(&path) {
                    Ok(meta) => (meta.is_file(), false),
                    Err(err) => {
                        debug!(%err, ?path, "dangling symlink; skipping");
                        continue;
                    }
                }
            } else {
                (file_type.is_file(), file_type.is_dir())
            };

            if chain.is_ignored(&path, is_dir) {
                continue;
            }

            if is_file {
                files.push(path);
            } else if is_dir {
                let child_chain = IgnoreChain::for_dir(&path, Some(chain.clone()));
                queue.push_back((path, child_chain));
            }
        }
    }

    files
}
