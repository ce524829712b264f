//! Observatory profiles: where the telescope is, what cameras it has, and
//! what software writes its images.
//!
//! A profile is an ordinary value that gets passed to whatever needs it.
//! [`Observatory::feder`] builds the built-in profile for Feder Observatory;
//! alternatives can be loaded from JSON.

use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path};

use crate::{
    error::{Error, Result},
    keyword::{canonical_name, StandardKeywords},
};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Site {
    pub name: String,

    /// Degrees north.
    pub latitude: f64,

    /// Degrees east.
    pub longitude: f64,

    /// Meters.
    pub height: f64,
}

impl Site {
    pub fn latitude_string(&self) -> String {
        sexagesimal(self.latitude, 4, true)
    }

    pub fn longitude_string(&self) -> String {
        sexagesimal(self.longitude, 4, true)
    }
}

/// Format an angle-like quantity as `DD:MM:SS.ssss`.
pub fn sexagesimal(value: f64, precision: usize, always_sign: bool) -> String {
    let sign = if value < 0. {
        "-"
    } else if always_sign {
        "+"
    } else {
        ""
    };

    // Round at the finest displayed unit first so that we never print
    // "60.0000" seconds.
    let scale = 10f64.powi(precision as i32);
    let total = (value.abs() * 3600. * scale).round() / scale;
    let whole = total.floor() as u64;
    let frac = total - whole as f64;
    let degrees = whole / 3600;
    let minutes = (whole % 3600) / 60;
    let seconds = (whole % 60) as f64 + frac;

    if precision == 0 {
        format!("{}{:02}:{:02}:{:02}", sign, degrees, minutes, seconds as u64)
    } else {
        format!(
            "{}{:02}:{:02}:{:0width$.prec$}",
            sign,
            degrees,
            minutes,
            seconds,
            width = precision + 3,
            prec = precision
        )
    }
}

/// One axis of a FITS-convention region such as `[1:3073, :]`: 1-based and
/// inclusive. `None` means the axis is unbounded on that side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AxisRange {
    pub start: Option<u64>,
    pub stop: Option<u64>,
}

/// Parse a FITS-style section string into per-axis ranges, in FITS axis order
/// (`NAXIS1` first).
pub fn parse_section(text: &str) -> Result<Vec<AxisRange>> {
    let bad = || Error::Profile(format!("malformed image section `{}`", text));

    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(bad)?;

    let mut axes = Vec::new();

    for piece in inner.split(',') {
        let piece = piece.trim();

        let parse_bound = |s: &str| -> Result<Option<u64>> {
            let s = s.trim();
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse().map(Some).map_err(|_| bad())
            }
        };

        let range = match piece.split_once(':') {
            Some((a, b)) => AxisRange {
                start: parse_bound(a)?,
                stop: parse_bound(b)?,
            },
            None => {
                let v = parse_bound(piece)?;
                AxisRange { start: v, stop: v }
            }
        };

        axes.push(range);
    }

    Ok(axes)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Instrument {
    pub name: String,

    /// The names by which this camera identifies itself in `INSTRUME`.
    pub fits_names: Vec<String>,

    /// Image size including overscan; zero if unknown.
    #[serde(default)]
    pub rows: u64,
    #[serde(default)]
    pub columns: u64,

    /// Value for `BUNIT`, if any.
    #[serde(default)]
    pub image_unit: Option<String>,

    /// Region to keep after overscan subtraction, FITS conventions.
    #[serde(default)]
    pub trim_region: Option<String>,

    /// The part of the overscan actually useful for calibration.
    #[serde(default)]
    pub useful_overscan: Option<String>,
}

impl Instrument {
    /// Decide whether an image of the given size (`NAXIS1`, `NAXIS2`) still
    /// has its overscan region attached.
    pub fn has_overscan(&self, naxis1: u64, naxis2: u64) -> Result<bool> {
        let Some(trim) = &self.trim_region else {
            return Ok(false);
        };

        let axes = parse_section(trim)?;
        let dims = [naxis1, naxis2];

        for (i, dim) in dims.iter().enumerate() {
            let end = match axes.get(i).and_then(|r| r.stop) {
                Some(stop) => stop + 1,
                None => *dim,
            };

            if end < *dim {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Software {
    pub name: String,

    /// The exact version strings that this software writes into its header.
    pub fits_names: Vec<String>,

    /// The header keyword carrying the version string.
    pub fits_keyword: String,

    #[serde(default)]
    pub major_version: Option<u32>,
    #[serde(default)]
    pub minor_version: Option<String>,

    /// Keywords this software writes that cannot be trusted.
    #[serde(default)]
    pub bad_keywords: Vec<String>,

    #[serde(default = "default_purged_flag")]
    pub purged_flag_keyword: String,
}

fn default_purged_flag() -> String {
    "PURGED".to_owned()
}

impl Software {
    pub fn created(&self, version_string: &str) -> bool {
        self.fits_names.iter().any(|n| n == version_string)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Observatory {
    pub site: Site,
    pub instruments: Vec<Instrument>,
    pub software: Vec<Software>,

    #[serde(skip)]
    pub keywords: StandardKeywords,
}

impl Observatory {
    pub fn feder() -> Self {
        fn strings(names: &[&str]) -> Vec<String> {
            names.iter().map(|s| (*s).to_owned()).collect()
        }

        let site = Site {
            name: "Feder Observatory".to_owned(),
            latitude: 46.86678,
            longitude: -96.453278,
            height: 311.8,
        };

        let instruments = vec![
            Instrument {
                name: "Apogee Alta U9".to_owned(),
                fits_names: strings(&["Apogee Alta", "Apogee USB/Net"]),
                rows: 2048,
                columns: 3085,
                image_unit: Some("adu".to_owned()),
                trim_region: Some("[1:3073, :]".to_owned()),
                useful_overscan: Some("[3076:3079, :]".to_owned()),
            },
            Instrument {
                name: "SBIG ST-7 Spectrometer".to_owned(),
                fits_names: strings(&["SBIG ST-7"]),
                rows: 0,
                columns: 0,
                image_unit: None,
                trim_region: None,
                useful_overscan: None,
            },
            Instrument {
                name: "Celestron Nightscape 10100".to_owned(),
                fits_names: strings(&["Celestron Nightscape 10100"]),
                rows: 0,
                columns: 0,
                image_unit: Some("adu".to_owned()),
                trim_region: None,
                useful_overscan: None,
            },
            Instrument {
                name: "Apogee Aspen CG16".to_owned(),
                fits_names: strings(&["Apogee Aspen CG16M"]),
                rows: 4096,
                columns: 4109,
                image_unit: Some("adu".to_owned()),
                trim_region: Some("[1:4096, :]".to_owned()),
                useful_overscan: Some("[4096:4109]".to_owned()),
            },
        ];

        let software = vec![
            Software {
                name: "MaxImDL".to_owned(),
                fits_names: strings(&["MaxIm DL Version 4.10"]),
                fits_keyword: "SWCREATE".to_owned(),
                major_version: Some(4),
                minor_version: Some("10".to_owned()),
                bad_keywords: strings(&["OBSERVER"]),
                purged_flag_keyword: default_purged_flag(),
            },
            Software {
                name: "MaxImDL".to_owned(),
                fits_names: strings(&[
                    "MaxIm DL Version 5.21 130912 01A17",
                    "MaxIm DL Version 5.21 120829 2R1M0",
                    "MaxIm DL Version 5.23 130912 01A17",
                    "MaxIm DL Version 5.15",
                ]),
                fits_keyword: "SWCREATE".to_owned(),
                major_version: Some(5),
                minor_version: Some("21".to_owned()),
                bad_keywords: strings(&[
                    "OBJECT", "JD", "JD-HELIO", "OBJCTALT", "OBJCTAZ", "OBJCTHA", "AIRMASS",
                    "OBSERVER",
                ]),
                purged_flag_keyword: default_purged_flag(),
            },
            Software {
                name: "SBIG CCDOps".to_owned(),
                fits_names: strings(&["SBIG Win CCDOPS Version 5.47 Build 6-NT"]),
                fits_keyword: "SWCREATE".to_owned(),
                major_version: Some(5),
                minor_version: Some("47".to_owned()),
                bad_keywords: Vec::new(),
                purged_flag_keyword: default_purged_flag(),
            },
            Software {
                name: "Celestron AstroFX".to_owned(),
                fits_names: strings(&["Celestron AstroFX V1.06"]),
                fits_keyword: "SWCREATE".to_owned(),
                major_version: Some(1),
                minor_version: Some("06".to_owned()),
                bad_keywords: Vec::new(),
                purged_flag_keyword: default_purged_flag(),
            },
        ];

        Observatory {
            site,
            instruments,
            software,
            keywords: StandardKeywords::new(),
        }
    }

    /// Load a profile from a JSON file and check that it makes sense.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| Error::path_io(path, e))?;

        let obs: Observatory = serde_json::from_reader(BufReader::new(f))
            .map_err(|e| Error::Profile(format!("{}: {}", path.display(), e)))?;

        obs.validate()?;
        Ok(obs)
    }

    /// Check the things that serde can't: keyword names, section strings, and
    /// that no header name maps to two different entries.
    pub fn validate(&self) -> Result<()> {
        if !(-90. ..=90.).contains(&self.site.latitude) {
            return Err(Error::Profile(format!(
                "site latitude {} out of range",
                self.site.latitude
            )));
        }

        let mut seen = std::collections::HashSet::new();

        for inst in &self.instruments {
            for region in [&inst.trim_region, &inst.useful_overscan].into_iter().flatten() {
                parse_section(region)?;
            }

            for n in &inst.fits_names {
                if !seen.insert(("instrument", n.as_str())) {
                    return Err(Error::Profile(format!(
                        "instrument name `{}` listed twice",
                        n
                    )));
                }
            }
        }

        for sw in &self.software {
            canonical_name(&sw.fits_keyword)?;
            canonical_name(&sw.purged_flag_keyword)?;

            for kw in &sw.bad_keywords {
                canonical_name(kw)?;
            }

            for n in &sw.fits_names {
                if !seen.insert(("software", n.as_str())) {
                    return Err(Error::Profile(format!("software name `{}` listed twice", n)));
                }
            }
        }

        Ok(())
    }

    pub fn instrument(&self, fits_name: &str) -> Option<&Instrument> {
        self.instruments
            .iter()
            .find(|i| i.fits_names.iter().any(|n| n == fits_name))
    }

    pub fn software_for(&self, version_string: &str) -> Option<&Software> {
        self.software.iter().find(|s| s.created(version_string))
    }

    /// All header keywords that may hold the name of the creating software,
    /// in first-seen order.
    pub fn software_keywords(&self) -> Vec<String> {
        let mut kws: Vec<String> = Vec::new();

        for sw in &self.software {
            let kw = sw.fits_keyword.to_uppercase();
            if !kws.contains(&kw) {
                kws.push(kw);
            }
        }

        kws
    }
}

impl Default for Observatory {
    fn default() -> Self {
        Self::feder()
    }
}
