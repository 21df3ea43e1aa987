use std::{
    collections::HashMap,
    ops::Bound,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, TimeZone, Utc};
use tantivy::{
    collector::{Count, TopDocs},
    doc,
    query::{BooleanQuery, Occur, Query, RangeQuery, TermQuery},
    schema::{IndexRecordOption, Term},
    Document, Index, IndexReader, IndexWriter, ReloadPolicy, Searcher,
};
use tracing::{debug, trace, warn};

use crate::{
    binary::is_binary,
    error::{Error, Result},
    schema::{DocFields, INDEXED_PATH_TAG, NGRAM_TOKENIZER, REQUIRED_FIELDS},
};

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Narrow adapter over the tantivy index. The worker thread is the only
/// code path that calls [`IndexStore::begin`]; searchers run against the
/// last committed snapshot and may be taken from any thread.
pub struct IndexStore {
    fields: DocFields,
    index: Index,
    reader: IndexReader,
    index_dir: PathBuf,
}

impl IndexStore {
    /// Open or create the index under `dir`. An existing index whose schema
    /// lacks a required field is refused rather than silently rebuilt.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let fields = DocFields::new();
        let index = if dir.join("meta.json").exists() {
            let index = Index::open_in_dir(dir)?;
            let schema = index.schema();
            let missing: Vec<String> = REQUIRED_FIELDS
                .iter()
                .filter(|name| schema.get_field(name).is_none())
                .map(|name| name.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(Error::SchemaMismatch {
                    dir: dir.to_owned(),
                    missing,
                });
            }
            debug!(?dir, "opened existing index");
            index
        } else {
            let index = Index::create_in_dir(dir, fields.schema())?;
            debug!(?dir, "created new index");
            index
        };

        index
            .tokenizers()
            .register(NGRAM_TOKENIZER, crate::schema::ngram_analyzer());

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommit)
            .try_into()?;

        Ok(Self {
            fields,
            index,
            reader,
            index_dir: dir.to_owned(),
        })
    }

    pub fn fields(&self) -> &DocFields {
        &self.fields
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Start a writer session. Tantivy's directory lock enforces that only
    /// one exists at a time.
    pub fn begin(&self) -> Result<WriteSession<'_>> {
        let writer = self.index.writer(WRITER_HEAP_BYTES)?;
        Ok(WriteSession {
            store: self,
            writer,
        })
    }

    /// Snapshot of the last committed state.
    pub fn searcher(&self) -> Searcher {
        self.reader.searcher()
    }

    /// Force the reader onto the latest commit.
    pub fn refresh(&self) -> Result<()> {
        self.reader.reload()?;
        Ok(())
    }

    /// All registered roots with their last-reconcile timestamps. Reads
    /// marker documents only; never touches the filesystem.
    pub fn list_roots(&self) -> Result<Vec<(PathBuf, DateTime<Utc>)>> {
        let searcher = self.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.fields.tag, INDEXED_PATH_TAG),
            IndexRecordOption::Basic,
        );

        let mut roots = vec![];
        for doc in self.collect_all(&searcher, &query)? {
            let Some(path) = doc.get_first(self.fields.path).and_then(|v| v.as_text()) else {
                continue;
            };
            let mtime = doc
                .get_first(self.fields.modified_time)
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            roots.push((PathBuf::from(path), datetime_from_secs(mtime)));
        }
        Ok(roots)
    }

    /// Last-reconcile timestamp of one root, if it is registered.
    pub fn root_mtime(&self, root: &Path) -> Result<Option<DateTime<Utc>>> {
        let roots = self.list_roots()?;
        Ok(roots.into_iter().find(|(p, _)| p == root).map(|(_, m)| m))
    }

    /// Map of stored file documents under `root`: path → stored mtime
    /// (unix seconds). Root markers are excluded.
    pub fn stored_under(&self, root: &Path) -> Result<HashMap<PathBuf, u64>> {
        let searcher = self.searcher();
        let root_str = root.to_string_lossy().into_owned();
        let upper = format!("{root_str}\u{10FFFF}");

        let range: Box<dyn Query> = Box::new(RangeQuery::new_str_bounds(
            self.fields.path,
            Bound::Included(root_str.as_str()),
            Bound::Included(upper.as_str()),
        ));
        let marker: Box<dyn Query> = Box::new(TermQuery::new(
            Term::from_field_text(self.fields.tag, INDEXED_PATH_TAG),
            IndexRecordOption::Basic,
        ));
        let query = BooleanQuery::new(vec![(Occur::Must, range), (Occur::MustNot, marker)]);

        let mut stored = HashMap::new();
        for doc in self.collect_all(&searcher, &query)? {
            let Some(path) = doc.get_first(self.fields.path).and_then(|v| v.as_text()) else {
                continue;
            };
            if !path_is_under(&root_str, path) {
                continue;
            }
            let mtime = doc
                .get_first(self.fields.modified_time)
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            stored.insert(PathBuf::from(path), mtime);
        }
        Ok(stored)
    }

    fn collect_all(&self, searcher: &Searcher, query: &dyn Query) -> Result<Vec<Document>> {
        let count = searcher.search(query, &Count)?;
        if count == 0 {
            return Ok(vec![]);
        }
        let top = searcher.search(query, &TopDocs::with_limit(count))?;
        let mut docs = Vec::with_capacity(top.len());
        for (_, addr) in top {
            docs.push(searcher.doc(addr)?);
        }
        Ok(docs)
    }
}

/// One `begin..end` critical section. Dropping the session without calling
/// [`WriteSession::end`] discards its writes (tantivy never makes them
/// visible before a commit).
pub struct WriteSession<'a> {
    store: &'a IndexStore,
    writer: IndexWriter,
}

impl WriteSession<'_> {
    /// The store this session writes to. Reads through it observe the last
    /// committed state, never this session's pending writes.
    pub fn store(&self) -> &IndexStore {
        self.store
    }

    /// Upsert one file document by path. Binary or unreadable files are
    /// indexed with empty content so the path itself stays searchable.
    pub fn add_file_document(&self, path: &Path) -> Result<()> {
        let fields = self.store.fields();
        let meta = std::fs::metadata(path)?;
        let mtime = unix_secs(meta.modified()?);
        let ctime = meta.created().map(unix_secs).unwrap_or(mtime);

        let content = if is_binary(path) {
            String::new()
        } else {
            match std::fs::read(path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => {
                    warn!(%err, ?path, "read failed; indexing path only");
                    String::new()
                }
            }
        };

        let path_str = path.to_string_lossy();
        trace!(%path_str, "writing document");

        self.writer
            .delete_term(Term::from_field_text(fields.path, &path_str));
        self.writer.add_document(doc!(
            fields.path => path_str.as_ref(),
            fields.path_content => path_str.as_ref(),
            fields.content => content,
            fields.create_time => ctime,
            fields.modified_time => mtime,
        ))?;
        Ok(())
    }

    /// Remove the document with exactly this path, if any.
    pub fn delete_by_path(&self, path: &Path) {
        self.writer.delete_term(Term::from_field_text(
            self.store.fields().path,
            &path.to_string_lossy(),
        ));
    }

    /// Remove every file document whose path lies under `root`. Returns the
    /// number of documents removed. Root markers are left alone; use
    /// [`WriteSession::untrack_root`] for those.
    pub fn delete_path_prefix(&self, root: &Path) -> Result<usize> {
        let stored = self.store.stored_under(root)?;
        for path in stored.keys() {
            self.delete_by_path(path);
        }
        Ok(stored.len())
    }

    /// Create or refresh the root marker for `root`.
    pub fn touch_root(&self, root: &Path, mtime: DateTime<Utc>) -> Result<()> {
        let fields = self.store.fields();
        let root_str = root.to_string_lossy();
        let ctime = std::fs::metadata(root)
            .and_then(|m| m.created())
            .map(unix_secs)
            .unwrap_or_else(|_| unix_secs(SystemTime::now()));

        debug!(%root_str, %mtime, "refreshing root marker");

        self.writer
            .delete_term(Term::from_field_text(fields.path, &root_str));
        self.writer.add_document(doc!(
            fields.path => root_str.as_ref(),
            fields.content => "",
            fields.tag => INDEXED_PATH_TAG,
            fields.create_time => ctime,
            fields.modified_time => secs_from_datetime(mtime),
        ))?;
        Ok(())
    }

    /// Drop the root marker for `root`.
    pub fn untrack_root(&self, root: &Path) {
        self.delete_by_path(root);
    }

    /// Commit (writes become visible to new searchers) or roll back.
    pub fn end(mut self, committed: bool) -> Result<()> {
        if committed {
            self.writer.commit()?;
        } else {
            self.writer.rollback()?;
        }
        Ok(())
    }
}

/// `path` is `root` itself or a descendant of it. Plain string prefixing
/// would make `/a/bc` a child of `/a/b`.
pub fn path_is_under(root: &str, path: &str) -> bool {
    if path == root {
        return true;
    }
    let root = root.trim_end_matches('/');
    path.starts_with(root) && path[root.len()..].starts_with('/')
}

pub fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn datetime_from_secs(secs: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn secs_from_datetime(t: DateTime<Utc>) -> u64 {
    t.timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn add_document_is_upsert_by_path() {
        let tmp = TempDir::new("store").unwrap();
        let index_dir = tmp.path().join("index");
        let store = IndexStore::open(&index_dir).unwrap();
        let file = write_file(tmp.path(), "a.txt", "first");

        let mut session = store.begin().unwrap();
        session.add_file_document(&file).unwrap();
        session.end(true).unwrap();

        std::fs::write(&file, "second").unwrap();
        let mut session = store.begin().unwrap();
        session.add_file_document(&file).unwrap();
        session.end(true).unwrap();

        store.refresh().unwrap();
        let stored = store.stored_under(tmp.path()).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn markers_survive_prefix_deletes() {
        let tmp = TempDir::new("store").unwrap();
        let index_dir = tmp.path().join("index");
        let root = tmp.path().join("tree");
        std::fs::create_dir(&root).unwrap();
        let file = write_file(&root, "a.txt", "hello");

        let store = IndexStore::open(&index_dir).unwrap();
        let mut session = store.begin().unwrap();
        session.add_file_document(&file).unwrap();
        session.touch_root(&root, Utc::now()).unwrap();
        session.end(true).unwrap();
        store.refresh().unwrap();

        let mut session = store.begin().unwrap();
        let deleted = session.delete_path_prefix(&root).unwrap();
        session.end(true).unwrap();
        store.refresh().unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(store.list_roots().unwrap().len(), 1);

        let mut session = store.begin().unwrap();
        session.untrack_root(&root);
        session.end(true).unwrap();
        store.refresh().unwrap();
        assert!(store.list_roots().unwrap().is_empty());
    }

    #[test]
    fn rolled_back_session_is_invisible() {
        let tmp = TempDir::new("store").unwrap();
        let store = IndexStore::open(&tmp.path().join("index")).unwrap();
        let file = write_file(tmp.path(), "a.txt", "hello");

        let mut session = store.begin().unwrap();
        session.add_file_document(&file).unwrap();
        session.end(false).unwrap();

        store.refresh().unwrap();
        assert!(store.stored_under(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn path_is_under_respects_separators() {
        assert!(path_is_under("/a/b", "/a/b"));
        assert!(path_is_under("/a/b", "/a/b/c.txt"));
        assert!(!path_is_under("/a/b", "/a/bc/c.txt"));
    }
}
