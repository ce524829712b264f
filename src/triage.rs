//! Triage: find out which images in a directory are missing information that
//! later steps will need, and write a manifest of what's there.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::{
    collection::{HeaderIndex, WILDCARD},
    error::{Error, Result},
    observatory::Observatory,
    table::{MetadataTable, Predicates},
};

/// Keywords tabulated unless told otherwise.
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "imagetyp", "filter", "exptime", "ccd-temp", "object", "observer", "airmass", "instrume", "RA",
    "Dec", "date-obs", "jd", "wcsaxes",
];

/// Names of the files that triage writes.
#[derive(Clone, Debug)]
pub struct OutputNames {
    pub object: Option<String>,
    pub pointing: Option<String>,
    pub filter: Option<String>,
    pub astrometry: Option<String>,
    pub manifest: Option<String>,
}

impl Default for OutputNames {
    fn default() -> Self {
        OutputNames {
            object: Some("NEEDS_OBJECT_NAME.txt".to_owned()),
            pointing: Some("NEEDS_POINTING_INFO.txt".to_owned()),
            filter: Some("NEEDS_FILTER.txt".to_owned()),
            astrometry: Some("NEEDS_ASTROMETRY.txt".to_owned()),
            manifest: Some("Manifest.txt".to_owned()),
        }
    }
}

impl OutputNames {
    fn all(&self) -> impl Iterator<Item = &str> {
        [
            &self.object,
            &self.pointing,
            &self.filter,
            &self.astrometry,
            &self.manifest,
        ]
        .into_iter()
        .flatten()
        .map(|s| s.as_str())
    }
}

#[derive(Clone, Debug, Default)]
pub struct TriageOptions {
    /// Keywords to tabulate; the defaults if empty.
    pub keywords: Vec<String>,

    /// Also tabulate every keyword present in any header.
    pub all_keywords: bool,

    /// Where to write the lists; the image directory if `None`.
    pub destination: Option<PathBuf>,

    pub names: OutputNames,
}

#[derive(Clone, Debug)]
pub struct TriageResult {
    /// Everything we learned, plus the source path and directory.
    pub table: MetadataTable,
    pub needs_filter: Vec<String>,
    pub needs_pointing: Vec<String>,
    pub needs_object_name: Vec<String>,
    pub needs_astrometry: Vec<String>,
}

/// Whether any image type is still in the MaxIm DL style (`Light Frame`).
fn has_maximdl_image_types(index: &HeaderIndex) -> Result<bool> {
    if !index
        .filter_rows(&Predicates::new().missing("imagetyp"))?
        .is_empty()
    {
        warn!("one or more images in `{}` is missing IMAGETYP", index.location().display());
    }

    Ok(index.values("imagetyp", true)?.iter().any(|v| {
        v.as_str()
            .map_or(false, |s| s.contains("frame") || s.contains("Frame"))
    }))
}

/// Examine the images in one directory.
pub fn triage_fits_files<P: AsRef<Path>>(obs: &Observatory, dir: P, opts: &TriageOptions) -> Result<TriageResult> {
    let dir = dir.as_ref();

    let mut keywords: Vec<String> = if opts.keywords.is_empty() {
        DEFAULT_KEYWORDS.iter().map(|s| (*s).to_owned()).collect()
    } else {
        opts.keywords.clone()
    };

    // These are needed to decide about pointing, and `imagetyp` for
    // everything else.
    let ra_names: Vec<String> = obs.keywords.ra.names().iter().map(|s| s.to_lowercase()).collect();
    let ha_names: Vec<String> = obs.keywords.hour_angle.names().iter().map(|s| s.to_lowercase()).collect();

    for k in std::iter::once("imagetyp")
        .chain(["filter", "object", "wcsaxes"])
        .chain(ra_names.iter().map(|s| s.as_str()))
        .chain(ha_names.iter().map(|s| s.as_str()))
    {
        if !keywords.iter().any(|have| have.eq_ignore_ascii_case(k)) {
            keywords.push(k.to_owned());
        }
    }

    if opts.all_keywords {
        keywords.push(WILDCARD.to_owned());
    }

    info!("examining directory `{}`", dir.display());
    let index = HeaderIndex::create(dir, &keywords)?;

    if has_maximdl_image_types(&index)? {
        return Err(Error::Triage(format!(
            "correct MaxIm DL-style image types in `{}` before proceeding",
            dir.display()
        )));
    }

    let mut needs_filter = index.filter(&Predicates::new().equals("imagetyp", "light").missing("filter"))?;
    needs_filter.extend(index.filter(&Predicates::new().equals("imagetyp", "flat").missing("filter"))?);

    let needs_object_name = index.filter(&Predicates::new().equals("imagetyp", "light").missing("object"))?;

    let table = index.table();
    let lights = index.filter_rows(&Predicates::new().equals("imagetyp", "light"))?;

    let all_missing = |names: &[String], row: usize| names.iter().all(|n| table.get(n, row).is_none());

    let needs_pointing = lights
        .iter()
        .filter(|&&r| all_missing(&ra_names, r) || all_missing(&ha_names, r))
        .map(|&r| table.file(r).to_owned())
        .collect();

    let needs_astrometry = lights
        .iter()
        .filter(|&&r| table.get("wcsaxes", r).is_none())
        .map(|&r| table.file(r).to_owned())
        .collect();

    let full_path = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let containing = full_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut table = table.clone();
    table.add_constant_column("Source path", full_path.to_string_lossy().as_ref())?;
    table.add_constant_column("Source directory", containing.as_str())?;

    Ok(TriageResult {
        table,
        needs_filter,
        needs_pointing,
        needs_object_name,
        needs_astrometry,
    })
}

/// Write a list of file names, one per line, under a `File` header line.
pub fn write_list<P: AsRef<Path>>(path: P, files: &[String]) -> Result<()> {
    let path = path.as_ref();
    let mut f = fs::File::create(path).map_err(|e| Error::path_io(path, e))?;
    writeln!(f, "File")?;

    for name in files {
        writeln!(f, "{}", name)?;
    }

    Ok(())
}

/// Triage each directory, writing the lists that aren't empty and the
/// manifest. Old lists are removed first so stale ones don't hang around.
pub fn triage_directories<P: AsRef<Path>>(
    obs: &Observatory,
    directories: &[P],
    opts: &TriageOptions,
) -> Result<Vec<TriageResult>> {
    let mut results = Vec::with_capacity(directories.len());

    for dir in directories {
        let dir = dir.as_ref();
        let target = opts.destination.as_deref().unwrap_or(dir);
        let result = triage_fits_files(obs, dir, opts)?;

        for name in opts.names.all() {
            let stale = dir.join(name);

            if stale.exists() {
                fs::remove_file(&stale).map_err(|e| Error::path_io(&stale, e))?;
            }
        }

        let names = &opts.names;
        let lists = [
            (&names.pointing, &result.needs_pointing),
            (&names.filter, &result.needs_filter),
            (&names.object, &result.needs_object_name),
            (&names.astrometry, &result.needs_astrometry),
        ];

        for (name, files) in lists {
            if let (Some(name), false) = (name, files.is_empty()) {
                write_list(target.join(name), files)?;
                info!("{} files listed in `{}`", files.len(), name);
            }
        }

        if let (Some(name), false) = (&names.manifest, result.table.is_empty()) {
            result.table.write_csv(target.join(name))?;
        }

        results.push(result);
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_names() {
        let names = OutputNames::default();
        let all: Vec<&str> = names.all().collect();
        assert_eq!(all.len(), 5);
        assert!(all.contains(&"Manifest.txt"));

        let partial = OutputNames {
            manifest: None,
            ..OutputNames::default()
        };
        assert_eq!(partial.all().count(), 4);
    }

    #[test]
    fn list_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NEEDS_FILTER.txt");
        write_list(&path, &["a.fit".to_owned(), "b.fit".to_owned()]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "File\na.fit\nb.fit\n");
    }
}
