use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::JoinHandle;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    query::SearchQuery,
    reconcile::reconcile,
    store::IndexStore,
    walker::walk_directory,
};

/// One queued mutation. Queries never go through the queue.
#[derive(Debug, Clone)]
enum Task {
    Index { path: PathBuf, full: bool },
    Update { path: PathBuf },
    Remove { path: PathBuf },
    Touch { path: Option<PathBuf>, mtime: DateTime<Utc> },
    Shutdown,
}

/// The indexing service: a single worker owns all writer sessions and
/// consumes tasks in FIFO order, while queries take reader snapshots on the
/// caller's thread.
///
/// With `use_service` off (tests, one-shot CLI runs) no worker is spawned;
/// each submit drains the queue synchronously instead.
pub struct Indexer {
    store: Arc<IndexStore>,
    tx: flume::Sender<Task>,
    rx: flume::Receiver<Task>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    use_service: bool,
}

impl Indexer {
    pub fn open(index_dir: &Path, use_service: bool) -> Result<Indexer> {
        let store = Arc::new(IndexStore::open(index_dir)?);
        let (tx, rx) = flume::unbounded();
        Ok(Indexer {
            store,
            tx,
            rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            use_service,
        })
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Spawn the worker thread. No-op in inline mode or when already
    /// running.
    pub fn start(&self) -> Result<()> {
        if !self.use_service {
            return Ok(());
        }
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let store = Arc::clone(&self.store);
        let rx = self.rx.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let handle = std::thread::Builder::new()
            .name("everything-indexer".into())
            .spawn(move || worker_loop(&store, &rx, &shutdown))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stop the worker at the next task boundary; the in-flight task
    /// finishes its writer session first.
    pub fn stop(&self) {
        if !self.use_service {
            return;
        }
        let handle = {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.take()
        };
        if let Some(handle) = handle {
            self.shutdown.store(true, Ordering::SeqCst);
            let _ = self.tx.send(Task::Shutdown);
            if handle.join().is_err() {
                error!("indexer worker panicked");
            }
        }
    }

    /// Walk `path` and (re-)index every file under it.
    pub fn index(&self, path: impl Into<PathBuf>, full: bool) {
        self.submit(Task::Index {
            path: path.into(),
            full,
        });
    }

    /// Reconcile the indexed set under `path` with the filesystem.
    pub fn update(&self, path: impl Into<PathBuf>) {
        self.submit(Task::Update { path: path.into() });
    }

    /// Delete every document under `path` and drop its root marker.
    pub fn remove(&self, path: impl Into<PathBuf>) {
        self.submit(Task::Remove { path: path.into() });
    }

    /// Set a root marker's timestamp; `None` touches every registered root.
    pub fn touch(&self, path: Option<PathBuf>, mtime: DateTime<Utc>) {
        self.submit(Task::Touch { path, mtime });
    }

    /// Synchronous query against a fresh snapshot.
    pub fn query(
        &self,
        path: Option<&str>,
        content: Option<&str>,
        ignore_case: bool,
        raw_pattern: bool,
    ) -> Result<SearchQuery> {
        SearchQuery::build(&self.store, path, content, ignore_case, raw_pattern)
    }

    pub fn list_roots(&self) -> Result<Vec<(PathBuf, DateTime<Utc>)>> {
        self.store.list_roots()
    }

    pub fn refresh_cache(&self) -> Result<()> {
        self.store.refresh()
    }

    fn submit(&self, task: Task) {
        if self.tx.send(task).is_err() {
            error!("task queue disconnected; dropping task");
            return;
        }
        if !self.use_service {
            // Inline mode: drain the queue on the caller's thread. The
            // sentinel stops the loop once everything queued so far ran.
            let _ = self.tx.send(Task::Shutdown);
            worker_loop(&self.store, &self.rx, &self.shutdown);
        }
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(store: &IndexStore, rx: &flume::Receiver<Task>, shutdown: &AtomicBool) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            debug!("shutdown flagged; quitting indexing worker");
            break;
        }

        let Ok(task) = rx.recv() else {
            debug!("task queue disconnected; quitting indexing worker");
            break;
        };

        if shutdown.load(Ordering::SeqCst) {
            debug!("shutdown flagged; dropping remaining tasks");
            break;
        }

        match task {
            Task::Shutdown => break,
            Task::Index { path, full } => run_index(store, &path, full, false),
            Task::Update { path } => run_index(store, &path, false, true),
            Task::Remove { path } => run_remove(store, &path),
            Task::Touch { path, mtime } => run_touch(store, path, mtime),
        }

        // Keep the reader on the newest commit so a query issued after the
        // task observes its writes.
        if let Err(err) = store.refresh() {
            warn!(%err, "reader reload failed");
        }
    }
}

fn run_index(store: &IndexStore, path: &Path, full: bool, update: bool) {
    let path = match std::fs::canonicalize(path) {
        Ok(path) => path,
        Err(err) => {
            warn!(%err, ?path, "index request for invalid path; skipping");
            return;
        }
    };

    info!(?path, update, full, "indexing path");

    let session = match store.begin() {
        Ok(session) => session,
        Err(err) => {
            error!(%err, "unable to open writer session");
            return;
        }
    };

    let outcome: anyhow::Result<bool> = (|| {
        if update && path.is_dir() {
            let stats = reconcile(&session, &path).context("reconcile failed")?;
            return Ok(stats.changed());
        }

        let entries = if path.is_dir() {
            walk_directory(&path)
        } else if path.is_file() {
            vec![path.clone()]
        } else {
            warn!(?path, "index request for a non-regular path; skipping");
            return Ok(false);
        };

        entries.par_iter().for_each(|file| {
            debug!(?file, "queueing file");
            if let Err(err) = session.add_file_document(file) {
                warn!(%err, ?file, "indexing failed; skipping");
            }
        });

        if path.is_dir() {
            session.touch_root(&path, Utc::now())?;
        }
        Ok(!entries.is_empty())
    })();

    finish(session, &path, outcome);
}

fn run_remove(store: &IndexStore, path: &Path) {
    // The tree may already be gone from disk; fall back to the path as
    // given so its documents are still matchable.
    let path = &std::fs::canonicalize(path).unwrap_or_else(|_| path.to_owned());
    info!(?path, "removing indexed path");

    let session = match store.begin() {
        Ok(session) => session,
        Err(err) => {
            error!(%err, "unable to open writer session");
            return;
        }
    };

    let outcome: anyhow::Result<bool> = (|| {
        let deleted = session.delete_path_prefix(path)?;
        session.untrack_root(path);
        debug!(?path, deleted, "removed documents");
        Ok(true)
    })();

    finish(session, path, outcome);
}

fn run_touch(store: &IndexStore, path: Option<PathBuf>, mtime: DateTime<Utc>) {
    let targets = match path {
        Some(path) => vec![std::fs::canonicalize(&path).unwrap_or(path)],
        None => match store.list_roots() {
            Ok(roots) => roots.into_iter().map(|(p, _)| p).collect(),
            Err(err) => {
                error!(%err, "unable to list roots for touch");
                return;
            }
        },
    };

    let session = match store.begin() {
        Ok(session) => session,
        Err(err) => {
            error!(%err, "unable to open writer session");
            return;
        }
    };

    let outcome: anyhow::Result<bool> = (|| {
        for root in &targets {
            if !root.exists() {
                warn!(?root, "touch target does not exist; skipping");
                continue;
            }
            debug!(?root, %mtime, "touching root marker");
            session.touch_root(root, mtime)?;
        }
        Ok(true)
    })();

    finish(session, Path::new("touch"), outcome);
}

/// Commit on success, roll back when the task failed mid-session. The
/// worker never propagates errors; the next task proceeds either way.
fn finish(session: crate::store::WriteSession<'_>, path: &Path, outcome: anyhow::Result<bool>) {
    let committed = match outcome {
        Ok(_) => true,
        Err(err) => {
            error!(%err, ?path, "task failed; rolling back");
            false
        }
    };
    if let Err(err) = session.end(committed) {
        error!(%err, ?path, "unable to close writer session");
    } else {
        debug!(?path, committed, "writer session closed");
    }
}
