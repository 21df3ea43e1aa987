use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("must provide either a path or a content pattern")]
    InvalidQuery,

    #[error("invalid regex `{pattern}`: {message}")]
    Regex { pattern: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] tantivy::TantivyError),

    #[error("index at {dir} is missing fields {missing:?}; delete the directory and reindex")]
    SchemaMismatch { dir: PathBuf, missing: Vec<String> },
}

impl Error {
    pub fn regex(pattern: &str, err: impl std::fmt::Display) -> Self {
        Self::Regex {
            pattern: pattern.to_owned(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
