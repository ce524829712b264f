//! Library error type.
//!
//! Per-file problems during a directory-wide operation are logged and skipped
//! by the code that hits them; the variants here are the things that a caller
//! needs to hear about.

use crate::value::ValueKind;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid header keyword `{0}`")]
    InvalidKeyword(String),

    #[error(
        "keyword {keyword} has inconsistent types: {first} in earlier files, \
         {second} in `{file}`"
    )]
    TypeMismatch {
        keyword: String,
        first: ValueKind,
        second: ValueKind,
        file: String,
    },

    #[error("no column named `{0}` in the metadata table")]
    UnknownKeyword(String),

    #[error("grouping column `{0}` is not in the metadata table")]
    MissingColumn(String),

    #[error("values in index column `{column}` are not unique (`{value}` repeats)")]
    NonUniqueIndex { column: String, value: String },

    #[error("no keyword named {0} could be found in the header")]
    KeywordNotFound(String),

    #[error("keyword synonyms have different values in the header: {0}")]
    InconsistentSynonyms(String),

    #[error("I/O error on `{path}`")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("malformed metadata table: {0}")]
    Table(String),

    #[error("FITS error: {0}")]
    Fits(String),

    #[error("bad observatory profile: {0}")]
    Profile(String),

    #[error("cannot patch header: {0}")]
    Patch(String),

    #[error("cannot triage: {0}")]
    Triage(String),

    #[error("cannot sort: {0}")]
    Sort(String),

    #[error("astrometry setup problem: {0}")]
    Astrometry(String),
}

impl Error {
    /// Flatten a low-level `anyhow` error from the FITS layer, keeping its
    /// chain of causes in the message.
    pub fn fits(err: anyhow::Error) -> Self {
        Error::Fits(format!("{:#}", err))
    }

    pub fn path_io<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Error::PathIo {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
