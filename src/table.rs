//! The metadata table: one row per image file, one column per header keyword.
//!
//! Every cell is an `Option<Value>`, with `None` meaning "this header doesn't
//! have the keyword". Missing-ness is never encoded as a special value, so a
//! legitimately empty string or a zero can't be confused with an absent
//! keyword.
//!
//! Column names are lowercase and are matched case-insensitively. The first
//! column is always `file`, which holds the bare file name of each row and is
//! never missing.

use crate::value::{Value, ValueKind};
use std::{
    fs::File,
    io::{BufReader, Read, Write},
    path::Path,
};

use crate::error::{Error, Result};

pub const FILE_COLUMN: &str = "file";

#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    name: String,
    cells: Vec<Option<Value>>,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cells(&self) -> &[Option<Value>] {
        &self.cells
    }

    pub fn get(&self, row: usize) -> Option<&Value> {
        self.cells.get(row).and_then(|c| c.as_ref())
    }

    pub fn is_missing(&self, row: usize) -> bool {
        self.get(row).is_none()
    }

    /// The kind shared by all present values, or `None` if the column is
    /// entirely missing.
    pub fn kind(&self) -> Option<ValueKind> {
        self.cells.iter().flatten().map(|v| v.kind()).next()
    }
}

/// What a predicate requires of one column.
#[derive(Clone, Debug, PartialEq)]
pub enum Match {
    /// The cell is present and matches the value: text case-insensitively,
    /// numbers exactly.
    Value(Value),

    /// The cell is present, with any value.
    Any,

    /// The cell is missing.
    Missing,
}

impl Match {
    pub fn accepts(&self, cell: Option<&Value>) -> bool {
        match (self, cell) {
            (Match::Missing, None) => true,
            (Match::Missing, Some(_)) => false,
            (Match::Any, cell) => cell.is_some(),
            (Match::Value(want), Some(have)) => have.matches(want),
            (Match::Value(_), None) => false,
        }
    }
}

impl From<Value> for Match {
    fn from(v: Value) -> Self {
        Match::Value(v)
    }
}

/// A conjunction of per-column requirements.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Predicates {
    terms: Vec<(String, Match)>,
}

impl Predicates {
    pub fn new() -> Self {
        Predicates::default()
    }

    pub fn with<K: AsRef<str>, M: Into<Match>>(mut self, key: K, m: M) -> Self {
        self.terms.push((key.as_ref().to_lowercase(), m.into()));
        self
    }

    pub fn equals<K: AsRef<str>, V: Into<Value>>(self, key: K, value: V) -> Self {
        self.with(key, Match::Value(value.into()))
    }

    pub fn any<K: AsRef<str>>(self, key: K) -> Self {
        self.with(key, Match::Any)
    }

    pub fn missing<K: AsRef<str>>(self, key: K) -> Self {
        self.with(key, Match::Missing)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[(String, Match)] {
        &self.terms
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetadataTable {
    columns: Vec<Column>,
}

impl MetadataTable {
    /// Create a table with just the `file` column.
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cells = files
            .into_iter()
            .map(|f| Some(Value::Text(f.into())))
            .collect();

        MetadataTable {
            columns: vec![Column {
                name: FILE_COLUMN.to_owned(),
                cells,
            }],
        }
    }

    pub fn n_rows(&self) -> usize {
        self.columns[0].cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn position(&self, name: &str) -> Option<usize> {
        let name = name.to_lowercase();
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column<S: AsRef<str>>(&self, name: S) -> bool {
        self.position(name.as_ref()).is_some()
    }

    pub fn column<S: AsRef<str>>(&self, name: S) -> Option<&Column> {
        self.position(name.as_ref()).map(|i| &self.columns[i])
    }

    fn require(&self, name: &str) -> Result<&Column> {
        self.column(name)
            .ok_or_else(|| Error::UnknownKeyword(name.to_lowercase()))
    }

    pub fn get<S: AsRef<str>>(&self, column: S, row: usize) -> Option<&Value> {
        self.column(column).and_then(|c| c.get(row))
    }

    /// The file name of a row.
    pub fn file(&self, row: usize) -> &str {
        self.columns[0].cells[row]
            .as_ref()
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    pub fn files(&self) -> Vec<&str> {
        (0..self.n_rows()).map(|i| self.file(i)).collect()
    }

    /// Add a column, replacing any existing column of the same name. All
    /// present values must be of one kind.
    pub fn push_column<S: AsRef<str>>(&mut self, name: S, cells: Vec<Option<Value>>) -> Result<()> {
        let name = name.as_ref().to_lowercase();

        if name == FILE_COLUMN {
            return Err(Error::Table("the file column cannot be replaced".to_owned()));
        }

        if cells.len() != self.n_rows() {
            return Err(Error::Table(format!(
                "column `{}` has {} cells but the table has {} rows",
                name,
                cells.len(),
                self.n_rows()
            )));
        }

        let column = Column { name, cells };
        self.check_kinds(&column)?;

        match self.position(&column.name) {
            Some(i) => self.columns[i] = column,
            None => self.columns.push(column),
        }

        Ok(())
    }

    fn check_kinds(&self, column: &Column) -> Result<()> {
        let mut first = None;

        for (row, cell) in column.cells.iter().enumerate() {
            let Some(v) = cell else { continue };

            match first {
                None => first = Some(v.kind()),
                Some(k) if k == v.kind() => {}
                Some(k) => {
                    return Err(Error::TypeMismatch {
                        keyword: column.name.clone(),
                        first: k,
                        second: v.kind(),
                        file: self.file(row).to_owned(),
                    })
                }
            }
        }

        Ok(())
    }

    /// Add a column holding the same value in every row.
    pub fn add_constant_column<S: AsRef<str>, V: Into<Value>>(&mut self, name: S, value: V) -> Result<()> {
        let value = value.into();
        let cells = vec![Some(value); self.n_rows()];
        self.push_column(name, cells)
    }

    /// Drop every column not named in `keep`. The `file` column always stays.
    /// Row order is untouched.
    pub fn retain_columns<S: AsRef<str>>(&mut self, keep: &[S]) {
        let keep: Vec<String> = keep.iter().map(|k| k.as_ref().to_lowercase()).collect();
        self.columns
            .retain(|c| c.name == FILE_COLUMN || keep.contains(&c.name));
    }

    /// All present values of a column, in row order, or just the distinct
    /// ones in first-seen order.
    pub fn values<S: AsRef<str>>(&self, column: S, unique: bool) -> Result<Vec<Value>> {
        let column = self.require(column.as_ref())?;
        let mut out: Vec<Value> = Vec::new();

        for v in column.cells.iter().flatten() {
            if unique && out.contains(v) {
                continue;
            }
            out.push(v.clone());
        }

        Ok(out)
    }

    /// Indices of the rows satisfying every predicate. Nothing about the table
    /// changes, so calls can be made in any order with no effect on each
    /// other.
    pub fn filter_rows(&self, predicates: &Predicates) -> Result<Vec<usize>> {
        let mut terms = Vec::with_capacity(predicates.terms().len());

        for (key, m) in predicates.terms() {
            terms.push((self.require(key)?, m));
        }

        Ok((0..self.n_rows())
            .filter(|&row| terms.iter().all(|(col, m)| m.accepts(col.get(row))))
            .collect())
    }

    /// A new table holding just the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> MetadataTable {
        let columns = self
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                cells: rows.iter().filter_map(|&r| c.cells.get(r).cloned()).collect(),
            })
            .collect();

        MetadataTable { columns }
    }

    /// Write the table as comma-separated text. The `file` column is written
    /// bare; other cells are FITS value literals, with missing cells left
    /// empty.
    pub fn to_csv_writer<W: Write>(&self, dest: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(dest);
        wtr.write_record(self.column_names())?;

        for row in 0..self.n_rows() {
            let record = self.columns.iter().map(|c| {
                if c.name == FILE_COLUMN {
                    self.file(row).to_owned()
                } else {
                    c.get(row).map(|v| v.to_literal()).unwrap_or_default()
                }
            });

            wtr.write_record(record)?;
        }

        wtr.flush()?;
        Ok(())
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let f = File::create(path).map_err(|e| Error::path_io(path, e))?;
        self.to_csv_writer(f)
    }

    pub fn from_csv_reader<R: Read>(src: R) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(src);
        let names: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_lowercase()).collect();

        let file_idx = names
            .iter()
            .position(|n| n == FILE_COLUMN)
            .ok_or_else(|| Error::Table("no `file` column".to_owned()))?;

        let mut files = Vec::new();
        let mut cells: Vec<Vec<Option<Value>>> = vec![Vec::new(); names.len()];

        for record in rdr.records() {
            let record = record?;

            for (i, field) in record.iter().enumerate() {
                if i == file_idx {
                    files.push(field.to_owned());
                    continue;
                }

                let value = decode_cell(field).map_err(|e| {
                    Error::Table(format!("bad value in column `{}`: {}", names[i], e))
                })?;
                cells[i].push(value);
            }
        }

        let mut table = MetadataTable::new(files);

        for (i, (name, column)) in names.into_iter().zip(cells).enumerate() {
            if i != file_idx {
                table.push_column(name, column)?;
            }
        }

        Ok(table)
    }

    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| Error::path_io(path, e))?;
        Self::from_csv_reader(BufReader::new(f))
    }
}

/// Cells are FITS value literals, except that quoted text is kept exactly as
/// written. FITS would drop trailing blanks, but table values don't all come
/// from headers.
fn decode_cell(field: &str) -> anyhow::Result<Option<Value>> {
    let trimmed = field.trim();

    match trimmed.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        Some(inner) => Ok(Some(Value::Text(inner.replace("''", "'")))),
        None => Value::parse_literal(trimmed),
    }
}
