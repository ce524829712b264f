//! Sorting images into a directory tree by type and metadata.
//!
//! ```text
//! destination/
//!   BIAS/
//!   DARK/<exptime>/
//!   FLAT/<filter>/<exptime>/
//!   LIGHT/<object>/<filter>/<exptime>/
//! ```
//!
//! Files lacking one of the keys their type is sorted by land in
//! `<TYPE>/unsorted`. Image types we don't know about get a directory with
//! no subdirectories, like biases.

use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use crate::{
    collection::HeaderIndex,
    error::{Error, Result},
    table::Predicates,
    tree::GroupingTree,
    value::Value,
};

pub const UNSORTED_DIR: &str = "unsorted";

/// Keywords read from every file.
pub const SORT_KEYWORDS: &[&str] = &["imagetyp", "exptime", "filter", "object"];

/// The grouping keys below each image type's directory.
pub fn sub_keys(image_type: &str) -> &'static [&'static str] {
    match image_type {
        "DARK" => &["exptime"],
        "FLAT" => &["filter", "exptime"],
        "LIGHT" => &["object", "filter", "exptime"],
        _ => &[],
    }
}

#[derive(Clone, Debug, Default)]
pub struct SortOptions {
    /// Where to build the tree; the source directory if `None`.
    pub destination: Option<PathBuf>,

    /// Move the files rather than copying them.
    pub move_files: bool,
}

/// Turn a header value into something usable as a single directory name,
/// one that stays inside the directory it is joined to.
fn dir_name(v: &Value) -> String {
    let s = v.to_string();
    let s = s.trim();

    if s.is_empty() {
        return "blank".to_owned();
    }

    let s = s.replace(['/', '\\'], "_");

    // `.`, `..` and hidden names.
    if s.starts_with('.') {
        format!("_{}", s)
    } else {
        s
    }
}

/// Transfer one file, logging rather than raising any failure so that the
/// rest of the directory still gets sorted.
fn place(src: &Path, dest_dir: &Path, move_files: bool, placed: &mut Vec<PathBuf>) {
    match transfer(src, dest_dir, move_files) {
        Ok(dest) => placed.push(dest),
        Err(e) => warn!("not sorting `{}`: {}", src.display(), e),
    }
}

fn transfer(src: &Path, dest_dir: &Path, move_files: bool) -> Result<PathBuf> {
    fs::create_dir_all(dest_dir).map_err(|e| Error::path_io(dest_dir, e))?;

    let name = src
        .file_name()
        .ok_or_else(|| Error::Sort(format!("`{}` has no file name", src.display())))?;
    let dest = dest_dir.join(name);

    if dest.exists() {
        return Err(Error::Sort(format!("`{}` already exists", dest.display())));
    }

    let result = if move_files {
        // Renaming fails across filesystems; fall back to copy and delete.
        fs::rename(src, &dest).or_else(|_| {
            fs::copy(src, &dest)?;
            fs::remove_file(src)
        })
    } else {
        fs::copy(src, &dest).map(|_| ())
    };

    result.map_err(|e: io::Error| Error::path_io(src, e))?;
    debug!("{} -> {}", src.display(), dest.display());
    Ok(dest)
}

/// Sort the images in `dir`. Returns the new paths of the files placed;
/// files that couldn't be placed are logged and left where they were.
pub fn sort_directory<P: AsRef<Path>>(dir: P, opts: &SortOptions) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let working = opts.destination.as_deref().unwrap_or(dir);

    info!("working on directory `{}`", dir.display());
    info!("destination directory is `{}`", working.display());

    let index = HeaderIndex::create(dir, SORT_KEYWORDS)?;
    let table = index.table();
    let mut placed = Vec::new();

    if table.is_empty() {
        return Ok(placed);
    }

    for file in index.filter(&Predicates::new().missing("imagetyp"))? {
        warn!("not sorting `{}`: it has no IMAGETYP", file);
    }

    let typed = index.filter_rows(&Predicates::new().any("imagetyp"))?;
    let by_type = GroupingTree::build_rows(table, &typed, &["imagetyp"], "file")?;

    for step in by_type.walk() {
        let (Some(Some(image_type)), false) = (step.parents.first(), step.ids.is_empty()) else {
            continue;
        };

        let type_name = dir_name(image_type);
        let type_dir = working.join(&type_name);
        let keys = sub_keys(&type_name);

        // Rows of this type, in table order.
        let rows: Vec<usize> = typed
            .iter()
            .copied()
            .filter(|&r| table.get("imagetyp", r) == Some(*image_type))
            .collect();

        let (clean, incomplete): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&r| keys.iter().all(|k| table.get(k, r).is_some()));

        if !incomplete.is_empty() {
            let dest = type_dir.join(UNSORTED_DIR);

            for r in incomplete {
                place(&dir.join(table.file(r)), &dest, opts.move_files, &mut placed);
            }
        }

        let tree = GroupingTree::build_rows(table, &clean, keys, "file")?;

        for leaf in tree.walk().filter(|s| !s.ids.is_empty()) {
            let mut dest = type_dir.clone();

            for p in &leaf.parents {
                match p {
                    Some(v) => dest.push(dir_name(v)),
                    None => dest.push(UNSORTED_DIR),
                }
            }

            for id in leaf.ids {
                let Some(name) = id.as_str() else { continue };
                place(&dir.join(name), &dest, opts.move_files, &mut placed);
            }
        }
    }

    info!("sorted {} files", placed.len());
    Ok(placed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert!(sub_keys("BIAS").is_empty());
        assert_eq!(sub_keys("FLAT"), &["filter", "exptime"]);
        assert!(sub_keys("SKYFLAT").is_empty());
    }

    #[test]
    fn directory_names() {
        assert_eq!(dir_name(&Value::Float(30.)), "30.0");
        assert_eq!(dir_name(&Value::from("M 101")), "M 101");
        assert_eq!(dir_name(&Value::from("B/V")), "B_V");
        assert_eq!(dir_name(&Value::from("  ")), "blank");
        assert_eq!(dir_name(&Value::from("..")), "_..");
        assert_eq!(dir_name(&Value::from(".")), "_.");
        assert_eq!(dir_name(&Value::from("../etc")), "_.._etc");
        assert_eq!(dir_name(&Value::from(".hidden")), "_.hidden");
        assert_eq!(dir_name(&Value::from("M..13")), "M..13");
    }
}
