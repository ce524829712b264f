//! Header bookkeeping for the Feder Observatory image pipeline
//!
//! The images that come off the telescope need a fair amount of attention
//! before anyone can do science with them: image types in the wrong style,
//! missing pointing, no site or time information, no WCS. This crate
//! inventories a directory of FITS files by their header keywords
//! ([`HeaderIndex`]), groups them ([`GroupingTree`]), and implements the
//! drivers that do something about what it finds: [`triage`], [`patch`],
//! [`sort`] and [`astrometry`].
//!
//! Everything observatory-specific lives in an [`Observatory`] profile that
//! gets passed around explicitly.

pub mod astrometry;
pub mod collection;
pub mod error;
pub mod fitsfile;
pub mod header;
pub mod keyword;
pub mod observatory;
pub mod patch;
pub mod sort;
pub mod table;
pub mod tree;
pub mod triage;
pub mod value;

pub use collection::{HeaderIndex, IterOptions, Record};
pub use error::{Error, Result};
pub use fitsfile::FitsRecord;
pub use header::{Card, Header};
pub use keyword::{Keyword, StandardKeywords};
pub use observatory::Observatory;
pub use table::{Match, MetadataTable, Predicates};
pub use tree::{GroupingTree, TreeNode, WalkStep};
pub use value::{Value, ValueKind};

use tracing_subscriber::EnvFilter;

/// Set up logging to stderr. `RUST_LOG`, if set, wins over `default_level`.
pub fn init_logging(default_level: tracing::Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_lowercase()));

    // `try_init` so that tests can call this more than once.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false) // don't print the module name
        .with_writer(std::io::stderr)
        .try_init();
}
