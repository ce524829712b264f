//! Fixing up the headers that come off the telescope.
//!
//! The acquisition software at the observatory writes headers that are
//! incomplete and, in a few places, wrong. The steps here remove the bad
//! keywords, normalize image types, and add the time, site, overscan and unit
//! information that later processing wants. [`patch_headers`] runs them over
//! a whole directory.

use chrono::{Local, NaiveDate, NaiveDateTime};
use crate::{fitsfile::FitsRecord, header::Header, value::Value};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

use crate::{
    collection::{HeaderIndex, IterOptions},
    error::{Error, Result},
    keyword::Keyword,
    observatory::{sexagesimal, Instrument, Observatory, Software},
};

/// Julian date of the Unix epoch.
const JD_UNIX_EPOCH: f64 = 2440587.5;

/// Offset between Julian and modified Julian dates.
const MJD_OFFSET: f64 = 2400000.5;

/// Julian date of J2000.0.
const JD_J2000: f64 = 2451545.0;

/// Convert a MaxIm DL style image type (`Light Frame`) to the IRAF style
/// (`LIGHT`). Already-IRAF types pass through unchanged.
pub fn iraf_image_type(image_type: &str) -> String {
    image_type
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase()
}

fn require_text<'a>(header: &'a Header, key: &str) -> Result<&'a str> {
    header
        .get_str(key)
        .ok_or_else(|| Error::Patch(format!("no {} in header", key.to_uppercase())))
}

pub fn change_imagetype_to_iraf(header: &mut Header, history: bool) -> Result<()> {
    let current = require_text(header, "IMAGETYP")?.to_owned();
    let iraf = iraf_image_type(&current);

    if current != iraf {
        header.set("IMAGETYP", iraf.as_str());
        let comment = format!("Changed IMAGETYP from {} to {}", current, iraf);
        info!("{}", comment);

        if history {
            header.add_history(comment);
        }
    }

    Ok(())
}

/// Figure out which program wrote this header.
pub fn software_in_header<'a>(obs: &'a Observatory, header: &Header) -> Result<&'a Software> {
    let keywords = obs.software_keywords();

    let Some((first, rest)) = keywords.split_first() else {
        return Err(Error::Profile("no image software defined".to_owned()));
    };

    let mut kw = Keyword::make(first, rest)?;
    kw.set_value_from_header(header)?;

    let name = match kw.value() {
        Some(Value::Text(s)) => s.as_str(),
        _ => return Err(Error::Patch(format!("{} is not text", kw.name()))),
    };

    obs.software_for(name)
        .ok_or_else(|| Error::Patch(format!("software `{}` not recognized", name)))
}

fn instrument_in_header<'a>(obs: &'a Observatory, header: &Header) -> Result<&'a Instrument> {
    let name = require_text(header, "INSTRUME")?;

    obs.instrument(name)
        .ok_or_else(|| Error::Patch(format!("instrument `{}` not recognized", name)))
}

/// Remove the keywords that the creating software is known to get wrong, and
/// mark the header so this isn't done twice.
pub fn purge_bad_keywords(
    obs: &Observatory,
    header: &mut Header,
    history: bool,
    force: bool,
    file_name: &str,
) -> Result<()> {
    let software = software_in_header(obs, header)?;
    let flag = software.purged_flag_keyword.as_str();

    let purged = header.get(flag).and_then(|v| v.as_bool()).unwrap_or(false);

    if purged && !force {
        warn!(
            "not removing bad keywords from `{}` again; force the purge to redo it",
            file_name
        );
        return Ok(());
    }

    for kw in &software.bad_keywords {
        if let Some(v) = header.remove(kw) {
            let comment = format!("Deleted keyword {} with value {}", kw, v);
            info!("{}", comment);

            if history {
                header.add_history(comment);
            }
        }
    }

    header.set_with_comment(flag, true, "Have bad keywords been removed?");
    Ok(())
}

/// Record where the overscan is, if the image still has it.
pub fn add_overscan_header(obs: &Observatory, header: &mut Header, history: bool) -> Result<Vec<Keyword>> {
    let naxis = |h: &Header, k: &str| -> Result<u64> {
        h.get(k)
            .and_then(|v| v.as_i64())
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| Error::Patch(format!("no usable {} in header", k)))
    };

    let dims = (naxis(header, "NAXIS1")?, naxis(header, "NAXIS2")?);
    let instrument = instrument_in_header(obs, header)?;

    if !instrument.has_overscan(dims.0, dims.1)? {
        return Ok(Vec::new());
    }

    let (Some(biassec), Some(trimsec)) = (&instrument.useful_overscan, &instrument.trim_region) else {
        return Ok(Vec::new());
    };

    let modified = vec![
        obs.keywords.biassec.clone().with_value(biassec.as_str()),
        obs.keywords.trimsec.clone().with_value(trimsec.as_str()),
    ];

    for kw in &modified {
        kw.add_to_header(header, true, history)?;
        info!("{}", kw.history_comment());
    }

    Ok(modified)
}

pub fn add_image_unit(obs: &Observatory, header: &mut Header, history: bool) -> Result<()> {
    let instrument = instrument_in_header(obs, header)?;

    if let Some(unit) = &instrument.image_unit {
        let comment = format!("Set image data unit to {}", unit);
        header.set("BUNIT", unit.as_str());
        info!("{}", comment);

        if history {
            header.add_history(comment);
        }
    }

    Ok(())
}

/// Parse a `DATE-OBS` value: an ISO timestamp, possibly with fractional
/// seconds, or a bare date.
pub fn parse_date_obs(text: &str) -> Result<NaiveDateTime> {
    let text = text.trim();

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(dt);
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| Error::Patch(format!("cannot parse DATE-OBS `{}`", text)))
}

/// Julian date of a UTC timestamp.
pub fn julian_date(dt: &NaiveDateTime) -> f64 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    let ms = dt.signed_duration_since(epoch).num_milliseconds();
    JD_UNIX_EPOCH + ms as f64 / 86_400_000.
}

/// Local mean sidereal time, in hours, at a Julian date and east longitude
/// in degrees.
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let gmst = 18.697374558 + 24.06570982441908 * (jd - JD_J2000);
    (gmst + longitude / 15.).rem_euclid(24.)
}

/// Add JD-OBS, MJD-OBS, LST and the site location.
pub fn add_time_info(obs: &Observatory, header: &mut Header, history: bool) -> Result<()> {
    let date_obs = parse_date_obs(require_text(header, "DATE-OBS")?)?;
    let jd = julian_date(&date_obs);
    let lst = local_sidereal_time(jd, obs.site.longitude);
    let kws = &obs.keywords;

    let updates = [
        kws.latitude.clone().with_value(obs.site.latitude_string()),
        kws.longitude.clone().with_value(obs.site.longitude_string()),
        kws.site_altitude.clone().with_value(obs.site.height),
        kws.lst.clone().with_value(sexagesimal(lst, 4, false)),
        kws.jd.clone().with_value(jd),
        kws.mjd.clone().with_value(jd - MJD_OFFSET),
    ];

    for kw in &updates {
        kw.add_to_header(header, true, history)?;
        info!("{}", kw.history_comment());
    }

    Ok(())
}

/// Which steps [`patch_headers`] runs, and where the results go.
#[derive(Clone, Debug)]
pub struct PatchOptions {
    pub suffix: String,
    pub save_location: Option<PathBuf>,
    pub overwrite: bool,
    pub purge_bad: bool,
    pub force_purge: bool,
    pub add_time: bool,
    pub add_overscan: bool,
    pub fix_imagetype: bool,
    pub add_unit: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        PatchOptions {
            suffix: "new".to_owned(),
            save_location: None,
            overwrite: false,
            purge_bad: true,
            force_purge: false,
            add_time: true,
            add_overscan: true,
            fix_imagetype: true,
            add_unit: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchSummary {
    pub patched: Vec<String>,
    pub failed: Vec<String>,
}

/// Start and end markers bracketing the history cards of one run.
pub fn history_marker(function: &str, begin: bool, time: &str) -> String {
    let (marker, mode) = if begin { ("+++++", "BEGIN") } else { ("-----", "END") };
    format!("{} {} {} history on {} {}", marker, mode, function, time, marker)
}

fn patch_one(obs: &Observatory, header: &mut Header, opts: &PatchOptions, file_name: &str) -> Result<()> {
    // Make sure the basics are there before changing anything.
    software_in_header(obs, header)?;
    require_text(header, "INSTRUME")?;
    require_text(header, "IMAGETYP")?;

    if opts.purge_bad {
        purge_bad_keywords(obs, header, true, opts.force_purge, file_name)?;
    }

    if opts.fix_imagetype {
        change_imagetype_to_iraf(header, true)?;
    }

    if opts.add_time {
        add_time_info(obs, header, true)?;
    }

    if opts.add_overscan {
        add_overscan_header(obs, header, true)?;
    }

    if opts.add_unit {
        add_image_unit(obs, header, true)?;
    }

    Ok(())
}

/// Patch every image in `dir`. A file that can't be patched is still saved,
/// with a history card saying so, and the rest of the batch carries on.
pub fn patch_headers<P: AsRef<Path>>(obs: &Observatory, dir: P, opts: &PatchOptions) -> Result<PatchSummary> {
    let index = HeaderIndex::create(dir.as_ref(), &["imagetyp"])?;

    let mut iter_opts = IterOptions::new()
        .suffix(opts.suffix.as_str())
        .overwrite(opts.overwrite);

    if let Some(loc) = &opts.save_location {
        fs::create_dir_all(loc).map_err(|e| Error::path_io(loc, e))?;
        iter_opts = iter_opts.location(loc);
    }

    let mut summary = PatchSummary::default();

    for mut record in index.iterate(iter_opts)? {
        let name = record.file_name().to_owned();
        let run_time = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        info!("START PATCHING FILE: {}", name);

        let header = record.header_mut();
        header.add_history(history_marker("patch_headers", true, &run_time));
        header.add_history(format!("patch_headers modified this file on {}", run_time));

        match patch_one(obs, header, opts, &name) {
            Ok(()) => summary.patched.push(name.clone()),
            Err(e) => {
                let msg = format!("********* FILE NOT PATCHED ********* {}: {}", name, e);
                warn!("{}", msg);
                header.add_history(msg);
                summary.failed.push(name.clone());
            }
        }

        header.add_history(history_marker("patch_headers", false, &run_time));
        info!("END PATCHING FILE: {}", name);
    }

    Ok(summary)
}

/// Interpret a value typed by a person: FITS literal syntax if it parses
/// (`'text'`, `T`, `12`, `1.5`), and plain text otherwise.
pub fn parse_user_value(text: &str) -> Value {
    match Value::parse_literal(text) {
        Ok(Some(v)) => v,
        _ => Value::Text(text.trim().to_owned()),
    }
}

/// Read a list of files: a header line, then one name per line.
pub fn read_file_list<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::path_io(path, e))?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some(h) if h.eq_ignore_ascii_case("file") => {}
        _ => {
            return Err(Error::Table(format!(
                "file list `{}` must start with a `File` header line",
                path.display()
            )))
        }
    }

    Ok(lines.map(PathBuf::from).collect())
}

/// Read keyword/value pairs: a header line, then `KEYWORD value` per line.
pub fn read_key_file<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Value)>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::path_io(path, e))?;
    let mut pairs = Vec::new();

    for line in text.lines().skip(1) {
        let line = line.trim();

        if line.is_empty() {
            continue;
        }

        let (key, value) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::Table(format!("no value for `{}` in `{}`", line, path.display())))?;

        pairs.push((key.to_owned(), parse_user_value(value)));
    }

    Ok(pairs)
}

/// Set keywords in each file, in place, with a history card for each.
pub fn add_keys(files: &[PathBuf], pairs: &[(String, Value)]) -> Result<()> {
    let keywords = pairs
        .iter()
        .map(|(k, v)| -> Result<Keyword> { Ok(Keyword::new(k)?.with_value(v.clone())) })
        .collect::<Result<Vec<_>>>()?;

    for path in files {
        info!("adding keys to file `{}`", path.display());
        let mut rec = FitsRecord::open(path).map_err(Error::fits)?;

        for kw in &keywords {
            kw.add_to_header(rec.header_mut(), true, true)?;
        }

        rec.write_to(path, true).map_err(Error::fits)?;
    }

    Ok(())
}
