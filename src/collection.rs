//! An index of the FITS images in one directory, keyed by header values.
//!
//! [`HeaderIndex`] reads the primary header of every image in a directory and
//! tabulates the keywords you ask for. Queries run against that table; the
//! files themselves are only reopened when you [`HeaderIndex::iterate`] over
//! them, which is also how header changes get written back to disk.
//!
//! An index is not meant to be shared across threads while it is being
//! modified, and two iterations writing into the same directory at once will
//! step on each other.

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    fitsfile::FitsRecord,
    header::Header,
    keyword::Keyword,
    table::{MetadataTable, Predicates, FILE_COLUMN},
    value::Value,
};

/// Base file extensions recognized as FITS images. Each may also carry a
/// `.gz` suffix.
pub const FITS_EXTENSIONS: &[&str] = &["fit", "fits", "fts"];

/// The keyword list entry meaning "every keyword found in any header".
pub const WILDCARD: &str = "*";

/// If `name` ends in a recognized FITS extension, split it into the stem and
/// the extension (including the leading dot and any `.gz`).
pub fn split_fits_extension(name: &str) -> Option<(&str, &str)> {
    let lower = name.to_ascii_lowercase();

    for ext in FITS_EXTENSIONS {
        for suffix in [format!(".{}", ext), format!(".{}.gz", ext)] {
            if lower.ends_with(&suffix) && lower.len() > suffix.len() {
                let cut = name.len() - suffix.len();
                return Some((&name[..cut], &name[cut..]));
            }
        }
    }

    None
}

/// List the FITS images directly inside a directory, sorted by name.
pub fn fits_files_in_directory<P: AsRef<Path>>(dir: P) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();

    for entry in fs::read_dir(dir).map_err(|e| Error::path_io(dir, e))? {
        let entry = entry.map_err(|e| Error::path_io(dir, e))?;

        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }

        if let Some(name) = entry.file_name().to_str() {
            if split_fits_extension(name).is_some() {
                files.push(name.to_owned());
            }
        }
    }

    files.sort();
    Ok(files)
}

/// Where `iterate` should write modified files, if anywhere.
#[derive(Clone, Debug, Default)]
pub struct IterOptions {
    /// Inserted between the file's stem and its FITS extension.
    pub save_suffix: String,

    /// Directory to write into instead of the source directory.
    pub save_location: Option<PathBuf>,

    /// Allow replacing existing files, including the originals.
    pub overwrite: bool,

    /// Only visit files matching these.
    pub predicates: Predicates,
}

impl IterOptions {
    pub fn new() -> Self {
        IterOptions::default()
    }

    pub fn suffix<S: Into<String>>(mut self, suffix: S) -> Self {
        self.save_suffix = suffix.into();
        self
    }

    pub fn location<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.save_location = Some(dir.into());
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn filter(mut self, predicates: Predicates) -> Self {
        self.predicates = predicates;
        self
    }

    /// Work out where a file from `source` should be saved. `None` means
    /// there is nothing to do: the destination is the source itself and
    /// overwriting wasn't requested.
    pub fn destination(&self, source: &Path) -> Option<PathBuf> {
        let name = source.file_name()?.to_str()?;

        let new_name = match split_fits_extension(name) {
            Some((stem, ext)) => format!("{}{}{}", stem, self.save_suffix, ext),
            None => format!("{}{}", name, self.save_suffix),
        };

        let dir = match &self.save_location {
            Some(d) => d.as_path(),
            None => source.parent().unwrap_or_else(|| Path::new(".")),
        };

        let dest = dir.join(new_name);

        if dest != source || self.overwrite {
            Some(dest)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct HeaderIndex {
    location: PathBuf,
    files: Vec<String>,
    requested: Vec<Keyword>,
    wildcard: bool,
    table: MetadataTable,
    generation: u64,
}

impl HeaderIndex {
    /// Index the images in `location`, tabulating the named keywords. The
    /// name `*` pulls in every keyword found in any header.
    pub fn create<P: Into<PathBuf>, S: AsRef<str>>(location: P, keywords: &[S]) -> Result<Self> {
        let (requested, wildcard) = parse_keyword_list(keywords)?;
        Self::build(location.into(), requested, wildcard)
    }

    /// Like [`Self::create`], but each column is filled from the first of the
    /// keyword's names present in a header, canonical name first.
    pub fn create_with_keywords<P: Into<PathBuf>>(location: P, keywords: &[Keyword]) -> Result<Self> {
        Self::build(location.into(), keywords.to_vec(), false)
    }

    fn build(location: PathBuf, requested: Vec<Keyword>, wildcard: bool) -> Result<Self> {
        let mut index = HeaderIndex {
            location,
            files: Vec::new(),
            requested,
            wildcard,
            table: MetadataTable::new(Vec::<String>::new()),
            generation: 0,
        };

        index.rebuild()?;
        Ok(index)
    }

    /// Rescan the directory and rebuild the table from scratch.
    fn rebuild(&mut self) -> Result<()> {
        self.files = fits_files_in_directory(&self.location)?;

        let mut names = Vec::with_capacity(self.files.len());
        let mut headers = Vec::with_capacity(self.files.len());

        for name in &self.files {
            let path = self.location.join(name);

            match crate::fitsfile::read_header(&path) {
                Ok(h) => {
                    names.push(name.clone());
                    headers.push(h);
                }

                Err(e) => {
                    warn!("skipping unreadable file `{}`: {:#}", path.display(), e);
                }
            }
        }

        let mut columns = self.requested.clone();

        if self.wildcard {
            for hdr in &headers {
                for kw in hdr.keywords() {
                    if !kw.eq_ignore_ascii_case(FILE_COLUMN)
                        && !columns.iter().any(|c| c.name() == kw)
                    {
                        // Header keywords that we can't represent (too
                        // long, odd characters) just don't become columns.
                        if let Ok(k) = Keyword::new(kw) {
                            columns.push(k);
                        }
                    }
                }
            }
        }

        let mut table = MetadataTable::new(names);

        for kw in &columns {
            let names = kw.names();

            let cells = headers
                .iter()
                .map(|h| names.iter().find_map(|n| h.get(n)).cloned())
                .collect();

            table.push_column(kw.name(), cells)?;
        }

        debug!(
            "indexed {} of {} files in `{}` with {} columns",
            table.n_rows(),
            self.files.len(),
            self.location.display(),
            columns.len()
        );

        self.table = table;
        self.generation += 1;
        Ok(())
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Every FITS file found in the directory, readable or not, sorted by
    /// name.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Full paths of the files in the table, in row order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.table
            .files()
            .into_iter()
            .map(|f| self.location.join(f))
            .collect()
    }

    pub fn table(&self) -> &MetadataTable {
        &self.table
    }

    /// Counts full rebuilds of the table; column trimming doesn't bump it.
    pub fn table_generation(&self) -> u64 {
        self.generation
    }

    /// Current column names, starting with `file`.
    pub fn keywords(&self) -> Vec<&str> {
        self.table.column_names()
    }

    /// Change the set of tabulated keywords. Asking for a subset of the
    /// current columns drops the others in place; anything else rescans the
    /// directory.
    pub fn set_keywords<S: AsRef<str>>(&mut self, keywords: &[S]) -> Result<()> {
        let (requested, wildcard) = parse_keyword_list(keywords)?;

        let is_subset = !wildcard
            && requested
                .iter()
                .all(|k| self.table.has_column(k.name()));

        let names: Vec<String> = requested.iter().map(|k| k.name().to_lowercase()).collect();

        if is_subset {
            // Keep the synonym lists of any Keywords we were created with.
            let mut kept: Vec<Keyword> = Vec::with_capacity(requested.len());

            for k in requested {
                match self.requested.iter().find(|r| r.name() == k.name()) {
                    Some(r) => kept.push(r.clone()),
                    None => kept.push(k),
                }
            }

            self.table.retain_columns(&names[..]);
            self.requested = kept;
            self.wildcard = false;
            return Ok(());
        }

        info!("rebuilding index of `{}`", self.location.display());
        self.requested = requested;
        self.wildcard = wildcard;
        self.rebuild()
    }

    pub fn values<S: AsRef<str>>(&self, keyword: S, unique: bool) -> Result<Vec<Value>> {
        self.table.values(keyword, unique)
    }

    /// Row indices of the files matching the predicates.
    pub fn filter_rows(&self, predicates: &Predicates) -> Result<Vec<usize>> {
        self.table.filter_rows(predicates)
    }

    /// Names of the files matching the predicates. This never changes the
    /// index, so repeated calls are independent of each other.
    pub fn filter(&self, predicates: &Predicates) -> Result<Vec<String>> {
        Ok(self
            .filter_rows(predicates)?
            .into_iter()
            .map(|r| self.table.file(r).to_owned())
            .collect())
    }

    /// Visit the matching files one at a time. Each file is opened only when
    /// it is reached, and each yielded [`Record`] writes itself back (per the
    /// options) when it is dropped.
    pub fn iterate(&self, options: IterOptions) -> Result<Records> {
        let files = self.filter(&options.predicates)?;

        Ok(Records {
            location: self.location.clone(),
            files: files.into_iter(),
            options,
        })
    }
}

/// Validate a keyword list, separating out the wildcard.
fn parse_keyword_list<S: AsRef<str>>(keywords: &[S]) -> Result<(Vec<Keyword>, bool)> {
    let mut requested: Vec<Keyword> = Vec::new();
    let mut wildcard = false;

    for k in keywords {
        let k = k.as_ref().trim();

        if k == WILDCARD {
            wildcard = true;
            continue;
        }

        if k.eq_ignore_ascii_case(FILE_COLUMN) {
            continue;
        }

        let kw = Keyword::new(k)?;

        if !requested.iter().any(|r| r.name() == kw.name()) {
            requested.push(kw);
        }
    }

    Ok((requested, wildcard))
}

/// The lazy sequence returned by [`HeaderIndex::iterate`].
#[derive(Debug)]
pub struct Records {
    location: PathBuf,
    files: std::vec::IntoIter<String>,
    options: IterOptions,
}

impl Iterator for Records {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        for name in self.files.by_ref() {
            let source = self.location.join(&name);

            match FitsRecord::open(&source) {
                Ok(record) => {
                    let destination = self.options.destination(&source);

                    return Some(Record {
                        record,
                        source,
                        destination,
                        overwrite: self.options.overwrite,
                    });
                }

                Err(e) => {
                    warn!("skipping `{}`: {:#}", source.display(), e);
                }
            }
        }

        None
    }
}

/// One file being visited by [`HeaderIndex::iterate`].
///
/// Change the header through [`Record::header_mut`]; when the record is
/// dropped it is saved to its destination, if it has one. Failures to save
/// are logged rather than raised so that one bad file doesn't end a batch
/// job. Use [`Record::save`] to see the error instead, or
/// [`Record::discard`] to skip saving.
#[derive(Debug)]
pub struct Record {
    record: FitsRecord,
    source: PathBuf,
    destination: Option<PathBuf>,
    overwrite: bool,
}

impl Record {
    pub fn file_name(&self) -> &str {
        self.source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    pub fn header(&self) -> &Header {
        self.record.header()
    }

    pub fn header_mut(&mut self) -> &mut Header {
        self.record.header_mut()
    }

    pub fn pixels(&self) -> anyhow::Result<ndarray::ArrayD<f64>> {
        self.record.pixels()
    }

    pub fn record(&self) -> &FitsRecord {
        &self.record
    }

    /// Save now, reporting any error. Nothing more happens on drop.
    pub fn save(mut self) -> anyhow::Result<()> {
        match self.destination.take() {
            Some(dest) => self.record.write_to(dest, self.overwrite),
            None => Ok(()),
        }
    }

    /// Drop the record without saving it.
    pub fn discard(mut self) {
        self.destination = None;
    }
}

impl Drop for Record {
    fn drop(&mut self) {
        // If the caller's loop body panicked, the header may be half-edited.
        if std::thread::panicking() {
            return;
        }

        if let Some(dest) = self.destination.take() {
            match self.record.write_to(&dest, self.overwrite) {
                Ok(()) => debug!("saved `{}`", dest.display()),
                Err(e) => warn!("failed to save `{}`: {:#}", dest.display(), e),
            }
        }
    }
}
