use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use clap::{ArgAction, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use regex::Regex;
use tracing::{debug, warn};

use crate::{
    config,
    output::{print_hits, OutputOptions},
    service::Indexer,
    store::path_is_under,
};

#[derive(Debug, Parser)]
#[command(name = "everything", about = "Persistent full-text file indexer and searcher")]
pub struct Args {
    /// print debug information
    #[arg(short = 'd', long = "debug", action = ArgAction::Count, global = true)]
    pub debug: u8,

    /// location which index files are stored in
    #[arg(short = 'l', long = "location", global = true, value_name = "index-dir")]
    pub location: Option<PathBuf>,

    #[command(subcommand)]
    pub op: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// index operations
    Index(IndexArgs),
    /// query operations
    Query(QueryArgs),
    /// list indexed paths
    List,
    /// ackmate-format content search for helm, falling back to ag
    #[command(name = "helm-ag")]
    HelmAg(HelmAgArgs),
    /// path search for helm, falling back to ag
    #[command(name = "helm-files")]
    HelmFiles(HelmFilesArgs),
    /// serve the HTTP index API
    Web(WebArgs),
}

#[derive(Debug, clap::Args)]
pub struct IndexArgs {
    /// delete index with path
    #[arg(short = 'r', long, conflicts_with_all = ["touch", "update"])]
    pub remove: bool,

    /// mark index last update time with the given time, or the current time
    #[arg(
        short = 't',
        long,
        num_args = 0..=1,
        default_missing_value = "now",
        value_name = "modified time",
        conflicts_with = "update"
    )]
    pub touch: Option<String>,

    /// update indexed files: remove deleted, add new and update modified files
    #[arg(short = 'u', long)]
    pub update: bool,

    /// file containing paths to be indexed, one per line
    #[arg(short = 'f', long, value_name = "list-file")]
    pub file: Option<PathBuf>,

    /// paths to be indexed
    #[arg(value_name = "path")]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, clap::Args)]
pub struct QueryArgs {
    /// path regex to match
    #[arg(short = 'p', long)]
    pub path: Option<String>,

    /// content regex to match
    #[arg(short = 'c', long)]
    pub content: Option<String>,

    /// case-insensitive matching
    #[arg(short = 'i', long)]
    pub ignore_case: bool,

    /// treat patterns as literal substrings, not regexes
    #[arg(long = "raw_pattern")]
    pub raw_pattern: bool,

    /// print matching paths only
    #[arg(long = "path_only")]
    pub path_only: bool,

    #[arg(long = "no_color")]
    pub no_color: bool,

    /// ackmate-style output for editor integration
    #[arg(long)]
    pub ackmate: bool,

    /// one line per match instead of grouping under the path
    #[arg(long = "no_group")]
    pub no_group: bool,

    /// cap the number of index candidates examined
    #[arg(long)]
    pub limit: Option<usize>,

    /// 1-based result page
    #[arg(long)]
    pub page: Option<usize>,

    #[arg(long = "page_size", default_value_t = 20)]
    pub page_size: usize,
}

#[derive(Debug, clap::Args)]
pub struct HelmAgArgs {
    /// path patterns to leave out of the results
    #[arg(long = "ignore", value_name = "pat")]
    pub ignore: Vec<String>,

    #[arg(long = "path-to-ignore", value_name = "pat")]
    pub path_to_ignore: Option<String>,

    pub pattern: String,

    pub path: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
pub struct HelmFilesArgs {
    pub pattern: String,

    pub path: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
pub struct WebArgs {
    /// the server port
    #[arg(short = 'p', long, default_value_t = 8192)]
    pub port: u16,
}

/// Indexers keyed by their store directory, owned by the entry point for
/// the lifetime of one invocation. Nothing module-global survives a run.
#[derive(Default)]
pub struct IndexerRegistry {
    indexers: HashMap<PathBuf, Arc<Indexer>>,
}

impl IndexerRegistry {
    pub fn get(&mut self, index_dir: &Path, use_service: bool) -> crate::Result<Arc<Indexer>> {
        if let Some(indexer) = self.indexers.get(index_dir) {
            return Ok(Arc::clone(indexer));
        }
        let indexer = Arc::new(Indexer::open(index_dir, use_service)?);
        self.indexers.insert(index_dir.to_owned(), Arc::clone(&indexer));
        Ok(indexer)
    }
}

pub fn run(args: Args) -> Result<()> {
    let index_dir = config::resolve_index_dir(args.location.as_deref())?;
    debug!(?index_dir, "index store location");

    let mut registry = IndexerRegistry::default();

    match args.op {
        Command::Index(index_args) => {
            let indexer = registry.get(&index_dir, false)?;
            indexer.refresh_cache()?;
            do_index(&indexer, &index_args)
        }
        Command::Query(query_args) => {
            let indexer = registry.get(&index_dir, false)?;
            indexer.refresh_cache()?;
            do_query(&indexer, &query_args, &mut std::io::stdout().lock())
        }
        Command::List => {
            let indexer = registry.get(&index_dir, false)?;
            indexer.refresh_cache()?;
            for (path, mtime) in indexer.list_roots()? {
                println!("path:{}, modified time:{}", path.display(), mtime);
            }
            Ok(())
        }
        Command::HelmAg(helm_args) => helm_ag(&mut registry, &index_dir, &helm_args),
        Command::HelmFiles(helm_args) => helm_files(&mut registry, &index_dir, &helm_args),
        Command::Web(web_args) => web(&index_dir, web_args.port),
    }
}

fn do_index(indexer: &Indexer, args: &IndexArgs) -> Result<()> {
    let touch_time = touch_time(args.touch.as_deref());

    let mut paths = args.paths.clone();
    if let Some(file) = &args.file {
        let contents = std::fs::read_to_string(file)
            .wrap_err_with(|| format!("unable to read list file {}", file.display()))?;
        paths.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(PathBuf::from),
        );
    }

    if paths.is_empty() {
        if let Some(mtime) = touch_time {
            indexer.touch(None, mtime);
        } else if args.update {
            for (root, _) in indexer.list_roots()? {
                indexer.update(root);
            }
        } else {
            warn!("no path given; nothing to index");
        }
        return Ok(());
    }

    for path in paths {
        if args.remove {
            indexer.remove(path);
        } else if let Some(mtime) = touch_time {
            indexer.touch(Some(path), mtime);
        } else if args.update {
            indexer.update(path);
        } else {
            indexer.index(path, false);
        }
    }
    Ok(())
}

/// `-t` without a value means "now"; a bad datetime warns and falls back
/// to "now" as well.
fn touch_time(arg: Option<&str>) -> Option<DateTime<Utc>> {
    let arg = arg?;
    if arg == "now" {
        return Some(Utc::now());
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(arg) {
        return Some(t.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(arg, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(arg, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDate::parse_from_str(arg, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN)));
    match naive {
        Ok(naive) => Some(
            Local
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        ),
        Err(_) => {
            warn!("invalid datetime string:{arg}");
            Some(Utc::now())
        }
    }
}

fn do_query(indexer: &Indexer, args: &QueryArgs, out: &mut impl Write) -> Result<()> {
    let query = indexer.query(
        args.path.as_deref(),
        args.content.as_deref(),
        args.ignore_case,
        args.raw_pattern,
    )?;

    let hits = match args.page {
        Some(page) => query.page(page, args.page_size)?,
        None => query.all(args.limit)?,
    };

    let opts = OutputOptions {
        no_color: args.no_color,
        ackmate: args.ackmate,
        path_only: args.path_only,
        no_group: args.no_group,
    };
    print_hits(out, &query, &hits, args.content.is_some(), &opts)?;
    Ok(())
}

fn web(index_dir: &Path, port: u16) -> Result<()> {
    let indexer = Arc::new(Indexer::open(index_dir, true)?);
    indexer.start()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(crate::webserver::serve(Arc::clone(&indexer), port));

    indexer.stop();
    result.wrap_err("web server failed")
}

/// A `--ignore` pattern: a regex when it compiles, a substring otherwise
/// (helm hands globs through verbatim).
enum PathFilter {
    Pattern(Regex),
    Literal(String),
}

impl PathFilter {
    fn new(pattern: &str) -> PathFilter {
        match Regex::new(pattern) {
            Ok(re) => PathFilter::Pattern(re),
            Err(_) => PathFilter::Literal(pattern.to_owned()),
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            PathFilter::Pattern(re) => re.is_match(path),
            PathFilter::Literal(s) => path.contains(s.as_str()),
        }
    }
}

fn helm_ag(registry: &mut IndexerRegistry, index_dir: &Path, args: &HelmAgArgs) -> Result<()> {
    let (indexer, target) = covering_indexer(registry, index_dir, args.path.as_deref())?;
    let Some(indexer) = indexer else {
        debug!(?target, "no index covers path; falling back to ag");
        return external_ag(&["--ackmate"], &args.ignore, &args.pattern, &target);
    };

    let mut filters: Vec<PathFilter> = args.ignore.iter().map(|p| PathFilter::new(p)).collect();
    if let Some(pattern) = &args.path_to_ignore {
        filters.push(PathFilter::new(pattern));
    }

    let target_str = target.to_string_lossy().into_owned();
    let query = indexer.query(None, Some(&args.pattern), true, false)?;
    let hits: Vec<_> = query
        .all(None)?
        .into_iter()
        .filter(|hit| path_is_under(&target_str, &hit.path.to_string_lossy()))
        .filter(|hit| {
            let path = hit.path.to_string_lossy();
            !filters.iter().any(|f| f.matches(&path))
        })
        .collect();

    let opts = OutputOptions {
        ackmate: true,
        no_color: true,
        ..Default::default()
    };
    print_hits(&mut std::io::stdout().lock(), &query, &hits, true, &opts)?;
    Ok(())
}

fn helm_files(registry: &mut IndexerRegistry, index_dir: &Path, args: &HelmFilesArgs) -> Result<()> {
    let (indexer, target) = covering_indexer(registry, index_dir, args.path.as_deref())?;
    let Some(indexer) = indexer else {
        debug!(?target, "no index covers path; falling back to ag");
        return external_ag(&["-g"], &[], &args.pattern, &target);
    };

    let target_str = target.to_string_lossy().into_owned();
    let query = indexer.query(Some(&args.pattern), None, true, false)?;
    let mut out = std::io::stdout().lock();
    for hit in query.all(None)? {
        if path_is_under(&target_str, &hit.path.to_string_lossy()) {
            writeln!(out, "{}", hit.path.display())?;
        }
    }
    Ok(())
}

/// Open the resolved index and check whether any registered root covers the
/// target directory. `None` means the caller should fall back to `ag`.
fn covering_indexer(
    registry: &mut IndexerRegistry,
    index_dir: &Path,
    path: Option<&Path>,
) -> Result<(Option<Arc<Indexer>>, PathBuf)> {
    let target = match path {
        Some(path) => path.to_owned(),
        None => std::env::current_dir()?,
    };
    let target = std::fs::canonicalize(&target).unwrap_or(target);

    let indexer = registry.get(index_dir, false)?;
    indexer.refresh_cache()?;

    let target_str = target.to_string_lossy().into_owned();
    let covered = indexer
        .list_roots()?
        .iter()
        .any(|(root, _)| path_is_under(&root.to_string_lossy(), &target_str));

    Ok((covered.then_some(indexer), target))
}

fn external_ag(extra: &[&str], ignore: &[String], pattern: &str, path: &Path) -> Result<()> {
    let mut cmd = std::process::Command::new("ag");
    cmd.args(extra);
    for pat in ignore {
        cmd.arg("--ignore").arg(pat);
    }
    cmd.arg(pattern).arg(path);

    let status = cmd
        .status()
        .wrap_err("unable to run ag; is it installed?")?;
    if !status.success() {
        // ag exits non-zero on "no matches"; nothing to surface.
        debug!(?status, "ag exited non-zero");
    }
    Ok(())
}
