use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use tantivy::{
    collector::{Count, TopDocs},
    query::{AllQuery, BooleanQuery, Occur, Query, TermQuery},
    schema::{IndexRecordOption, Term},
    Document, Searcher,
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    regex_query::RegexQueryBuilder,
    schema::{DocFields, INDEXED_PATH_TAG},
    store::{datetime_from_secs, IndexStore},
};

/// One candidate file accepted by verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub path: PathBuf,
    pub modified_time: DateTime<Utc>,
}

/// One verified match within a line of a hit's file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    /// Zero-based line number.
    pub line: usize,
    /// Byte column of the match start within the line.
    pub col: usize,
    /// Byte length of the match.
    pub len: usize,
    /// The line without its terminator.
    pub text: String,
}

/// Verification matcher for one field. A pattern that failed to compile
/// still runs the index scan but accepts nothing, so bad input degrades to
/// an empty result instead of an error deep in iteration.
enum Verifier {
    Absent,
    Matcher(Regex),
    Never,
}

impl Verifier {
    fn compile(pattern: &str, ignore_case: bool, raw_pattern: bool) -> Verifier {
        let source = if raw_pattern {
            regex::escape(pattern)
        } else {
            pattern.to_owned()
        };
        match RegexBuilder::new(&source)
            .case_insensitive(ignore_case)
            .multi_line(true)
            .build()
        {
            Ok(re) => Verifier::Matcher(re),
            Err(err) => {
                warn!(%err, pattern, "verification pattern does not compile; query will yield no hits");
                Verifier::Never
            }
        }
    }

    fn accepts(&self, text: &str) -> bool {
        match self {
            Verifier::Absent => true,
            Verifier::Matcher(re) => re.is_match(text),
            Verifier::Never => false,
        }
    }
}

/// A prepared query holding a searcher snapshot. Hits observed through one
/// handle are consistent with a single committed state of the index.
pub struct SearchQuery {
    searcher: Searcher,
    fields: DocFields,
    query: Box<dyn Query>,
    path_verify: Verifier,
    content_verify: Verifier,
}

impl SearchQuery {
    /// Build the index query and verification matchers. At least one of
    /// `path` and `content` must be given.
    ///
    /// The content sub-query drives the index search when present; a path
    /// pattern is then only verified against candidate paths, because path
    /// n-grams constrain far less than content n-grams do.
    pub fn build(
        store: &IndexStore,
        path: Option<&str>,
        content: Option<&str>,
        ignore_case: bool,
        raw_pattern: bool,
    ) -> Result<SearchQuery> {
        if path.is_none() && content.is_none() {
            return Err(Error::InvalidQuery);
        }

        let fields = store.fields().clone();
        let builder = RegexQueryBuilder::new();

        let (pattern, field) = match (content, path) {
            (Some(c), _) => (c, fields.content),
            (None, Some(p)) => (p, fields.path_content),
            (None, None) => unreachable!("checked above"),
        };
        let node = if raw_pattern {
            builder.raw_literal(pattern)
        } else {
            match builder.build(pattern) {
                Ok(node) => node,
                Err(err) => {
                    warn!(%err, pattern, "unable to lower pattern; scanning unconstrained");
                    crate::regex_query::QueryNode::Empty
                }
            }
        };
        debug!(pattern, query = %node, "lowered index query");
        let driver = node.to_query(field);

        let marker: Box<dyn Query> = Box::new(TermQuery::new(
            Term::from_field_text(fields.tag, INDEXED_PATH_TAG),
            IndexRecordOption::Basic,
        ));
        let query = BooleanQuery::new(vec![
            (Occur::Must, driver.unwrap_or_else(|| Box::new(AllQuery))),
            (Occur::MustNot, marker),
        ]);

        let path_verify = match path {
            Some(p) => Verifier::compile(p, ignore_case, raw_pattern),
            None => Verifier::Absent,
        };
        let content_verify = match content {
            Some(c) => Verifier::compile(c, ignore_case, raw_pattern),
            None => Verifier::Absent,
        };

        Ok(SearchQuery {
            searcher: store.searcher(),
            fields,
            query: Box::new(query),
            path_verify,
            content_verify,
        })
    }

    /// All verified hits, optionally capped to the first `limit` candidates.
    pub fn all(&self, limit: Option<usize>) -> Result<Vec<Hit>> {
        let count = self.searcher.search(&*self.query, &Count)?;
        let candidates = match limit {
            Some(limit) => count.min(limit),
            None => count,
        };
        if candidates == 0 {
            return Ok(vec![]);
        }
        let top = self
            .searcher
            .search(&*self.query, &TopDocs::with_limit(candidates))?;
        self.verify(top)
    }

    /// One page of verified hits; pages are 1-based.
    pub fn page(&self, page: usize, page_size: usize) -> Result<Vec<Hit>> {
        let offset = page.saturating_sub(1) * page_size;
        let top = self.searcher.search(
            &*self.query,
            &TopDocs::with_limit(page_size.max(1)).and_offset(offset),
        )?;
        self.verify(top)
    }

    /// Per-line match spans in `hit`'s file, from the compiled verification
    /// regex (never the n-gram query). Matches spanning a line break are
    /// dropped.
    pub fn matches(&self, hit: &Hit) -> Result<Vec<LineMatch>> {
        let Verifier::Matcher(re) = &self.content_verify else {
            return Ok(vec![]);
        };
        let text = read_lossy(&hit.path)?;
        Ok(line_matches(re, &text))
    }

    fn verify(&self, top: Vec<(f32, tantivy::DocAddress)>) -> Result<Vec<Hit>> {
        let mut hits = vec![];
        for (_, addr) in top {
            let doc = self.searcher.doc(addr)?;
            if let Some(hit) = self.accept(doc) {
                hits.push(hit);
            }
        }
        Ok(hits)
    }

    fn accept(&self, doc: Document) -> Option<Hit> {
        let path = doc.get_first(self.fields.path).and_then(|v| v.as_text())?;

        if !self.path_verify.accepts(path) {
            debug!(path, "candidate path fails verification; skipping");
            return None;
        }

        let path_buf = PathBuf::from(path);
        if !path_buf.exists() {
            // Stale entries are the reconciler's to delete, not ours.
            debug!(path, "indexed file no longer exists; skipping");
            return None;
        }

        match &self.content_verify {
            Verifier::Absent => {}
            verifier => {
                let text = read_lossy(&path_buf).ok()?;
                if !verifier.accepts(&text) {
                    debug!(path, "candidate content fails verification; skipping");
                    return None;
                }
            }
        }

        let mtime = doc
            .get_first(self.fields.modified_time)
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Some(Hit {
            path: path_buf,
            modified_time: datetime_from_secs(mtime),
        })
    }
}

fn read_lossy(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Walk the regex over `text` and emit one record per single-line match.
fn line_matches(re: &Regex, text: &str) -> Vec<LineMatch> {
    let mut line_starts = vec![0usize];
    line_starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));

    let mut out = vec![];
    for m in re.find_iter(text) {
        if m.as_str().contains('\n') {
            continue;
        }
        let line = line_starts.partition_point(|&s| s <= m.start()) - 1;
        let line_start = line_starts[line];
        let line_end = text[line_start..]
            .find('\n')
            .map(|i| line_start + i)
            .unwrap_or(text.len());
        let line_text = text[line_start..line_end].trim_end_matches('\r');

        out.push(LineMatch {
            line,
            col: m.start() - line_start,
            len: m.end() - m.start(),
            text: line_text.to_owned(),
        });
    }
    out
}
