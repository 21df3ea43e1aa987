//! A local full-text file indexer and searcher: register directories,
//! index their textual files into a persistent n-gram inverted index, and
//! answer path/content regex queries with per-line match spans.
//!
//! Regexes are lowered to boolean n-gram queries so the index returns a
//! candidate superset; the compiled regex then verifies every hit. All
//! index mutations go through a single-writer task queue; queries run on
//! the caller's thread against committed snapshots.

pub mod binary;
pub mod cli;
pub mod config;
pub mod error;
pub mod output;
pub mod query;
pub mod reconcile;
pub mod regex_query;
pub mod schema;
pub mod service;
pub mod store;
pub mod walker;
pub mod webserver;

pub use error::{Error, Result};
pub use query::{Hit, LineMatch, SearchQuery};
pub use service::Indexer;
pub use store::IndexStore;
