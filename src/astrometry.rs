//! Plate solving with astrometry.net's `solve-field`.
//!
//! We don't solve anything ourselves; this module builds the command line,
//! runs the program as a child process and cleans up the pile of files it
//! leaves behind. The caller only gets to hear whether the solve worked and
//! what the program said.

use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    fs,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{process::Command, runtime};
use tracing::{debug, error, info, warn};

use crate::{
    collection::HeaderIndex,
    error::{Error, Result},
    fitsfile::FitsRecord,
    observatory::sexagesimal,
    table::Predicates,
};

pub const SOLVE_FIELD: &str = "solve-field";

/// Approximate plate scales in arcsec per pixel.
pub static CAMERA_PIXEL_SCALES: Lazy<HashMap<&'static str, f64>> =
    Lazy::new(|| HashMap::from([("celestron", 0.3), ("u9", 0.55), ("cp16", 0.55)]));

/// Scale range used when no camera is named.
pub const DEFAULT_SCALE_RANGE: (f64, f64) = (0.4, 0.6);

/// SExtractor settings tuned for our images: a bigger minimum area and no
/// filter convolution.
const SEXTRACTOR_CONFIG: &str = "\
PARAMETERS_NAME  {param_file}
DETECT_TYPE      CCD
DETECT_MINAREA   15
DETECT_THRESH    1.5
ANALYSIS_THRESH  1.5
FILTER           N
DEBLEND_NTHRESH  32
DEBLEND_MINCONT  0.005
CLEAN            Y
CLEAN_PARAM      1.0
MASK_TYPE        CORRECT
CATALOG_TYPE     FITS_1.0
";

const SEXTRACTOR_PARAMS: &str = "X_IMAGE\nY_IMAGE\nMAG_AUTO\nFLUX_AUTO\n";

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Sextractor {
    /// Use the source finder built into astrometry.net.
    #[default]
    BuiltIn,

    /// Use whatever `sex` is on the path.
    OnPath,

    Path(PathBuf),
}

/// Settings for one `solve-field` run.
#[derive(Clone, Debug)]
pub struct SolveOptions {
    pub program: PathBuf,
    pub sextractor: Sextractor,

    /// Write and use our own SExtractor configuration.
    pub custom_sextractor_config: bool,

    /// Plate scale bounds in arcsec per pixel.
    pub scale: Option<(f64, f64)>,

    pub max_objects: u32,
    pub no_plots: bool,

    /// Skip the correspondence, rdls and match outputs.
    pub minimal_output: bool,

    /// With `minimal_output`, still write the `.wcs` file.
    pub save_wcs: bool,

    /// Approximate RA and Dec of the field center, in any format
    /// `solve-field` understands.
    pub ra_dec: Option<(String, String)>,

    /// Search radius around `ra_dec`, in degrees.
    pub radius: f64,

    pub overwrite: bool,

    /// Put the WCS reference pixel at the center of the image.
    pub crpix_center: bool,

    pub odds_ratio: Option<String>,
    pub config: Option<PathBuf>,
    pub verify: Option<PathBuf>,
    pub extra_args: Vec<String>,

    /// Give up on the child process after this long.
    pub timeout: Option<Duration>,
}

impl Default for SolveOptions {
    fn default() -> Self {
        SolveOptions {
            program: PathBuf::from(SOLVE_FIELD),
            sextractor: Sextractor::BuiltIn,
            custom_sextractor_config: false,
            scale: Some(DEFAULT_SCALE_RANGE),
            max_objects: 200,
            no_plots: true,
            minimal_output: true,
            save_wcs: false,
            ra_dec: None,
            radius: 0.5,
            overwrite: false,
            crpix_center: true,
            odds_ratio: None,
            config: None,
            verify: None,
            extra_args: Vec::new(),
            timeout: None,
        }
    }
}

impl SolveOptions {
    /// Use the plate scale of a known camera, give or take 20%.
    pub fn camera(mut self, name: &str) -> Result<Self> {
        let scale = CAMERA_PIXEL_SCALES
            .get(name.to_lowercase().as_str())
            .ok_or_else(|| Error::Astrometry(format!("unknown camera `{}`", name)))?;

        self.scale = Some((0.8 * scale, 1.2 * scale));
        Ok(self)
    }

    pub fn ra_dec<R: Into<String>, D: Into<String>>(mut self, ra: R, dec: D) -> Self {
        self.ra_dec = Some((ra.into(), dec.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The arguments to pass to `solve-field`, not including the file name
    /// or anything needed for a custom SExtractor configuration.
    pub fn args(&self) -> Vec<OsString> {
        let mut args = vec![os("--obj"), os(self.max_objects.to_string())];

        if let Some((low, high)) = self.scale {
            args.extend([
                os("--scale-low"),
                os(low.to_string()),
                os("--scale-high"),
                os(high.to_string()),
                os("--scale-units"),
                os("arcsecperpix"),
            ]);
        }

        args.extend(self.extra_args.iter().map(os));

        match &self.sextractor {
            Sextractor::BuiltIn => {}
            Sextractor::OnPath => args.push(os("--use-sextractor")),
            Sextractor::Path(p) => args.extend([os("--sextractor-path"), os(p)]),
        }

        if self.no_plots {
            args.push(os("--no-plot"));
        }

        if self.minimal_output {
            args.extend(["--corr", "none", "--rdls", "none", "--match", "none"].map(os));

            if !self.save_wcs {
                args.extend([os("--wcs"), os("none")]);
            }
        }

        if let Some((ra, dec)) = &self.ra_dec {
            args.extend([
                os("--ra"),
                os(ra),
                os("--dec"),
                os(dec),
                os("--radius"),
                os(self.radius.to_string()),
            ]);
        }

        if self.overwrite {
            args.push(os("--overwrite"));
        }

        if self.crpix_center {
            args.push(os("--crpix-center"));
        }

        if let Some(odds) = &self.odds_ratio {
            args.extend([os("--odds-to-solve"), os(odds)]);
        }

        if let Some(c) = &self.config {
            args.extend([os("--config"), os(c)]);
        }

        if let Some(v) = &self.verify {
            args.extend([os("--verify"), os(v)]);
        }

        args
    }
}

fn os<S: AsRef<OsStr>>(s: S) -> OsString {
    s.as_ref().to_owned()
}

/// What came of running `solve-field` once.
#[derive(Clone, Debug, PartialEq)]
pub struct SolveOutcome {
    pub solved: bool,

    /// Everything the program printed, or why it couldn't be run.
    pub diagnostic: String,
}

impl SolveOutcome {
    fn failed<S: Into<String>>(diagnostic: S) -> Self {
        SolveOutcome {
            solved: false,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Write our SExtractor configuration into `dir`, returning the extra
/// `solve-field` arguments that use it.
fn write_sextractor_config(dir: &Path) -> Result<Vec<OsString>> {
    let params = dir.join("default.param");
    let config = dir.join("feder.config");

    fs::write(&params, SEXTRACTOR_PARAMS).map_err(|e| Error::path_io(&params, e))?;
    fs::write(
        &config,
        SEXTRACTOR_CONFIG.replace("{param_file}", &params.to_string_lossy()),
    )
    .map_err(|e| Error::path_io(&config, e))?;

    let mut args = vec![os("--sextractor-config"), os(&config)];
    args.extend(
        [
            "--x-column",
            "X_IMAGE",
            "--y-column",
            "Y_IMAGE",
            "--sort-column",
            "MAG_AUTO",
            "--sort-ascending",
        ]
        .map(os),
    );

    Ok(args)
}

async fn run_solver(mut cmd: Command, timeout: Option<Duration>) -> SolveOutcome {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return SolveOutcome::failed(format!("could not start solver: {}", e)),
    };

    // If the timeout fires, the child is dropped, which kills it.
    let output = match timeout {
        Some(t) => match tokio::time::timeout(t, child.wait_with_output()).await {
            Ok(o) => o,
            Err(_) => {
                return SolveOutcome::failed(format!("solver timed out after {:?}", t));
            }
        },

        None => child.wait_with_output().await,
    };

    match output {
        Ok(o) => {
            let mut diagnostic = String::from_utf8_lossy(&o.stdout).into_owned();
            diagnostic.push_str(&String::from_utf8_lossy(&o.stderr));

            SolveOutcome {
                solved: o.status.success(),
                diagnostic,
            }
        }

        Err(e) => SolveOutcome::failed(format!("error waiting for solver: {}", e)),
    }
}

/// Run `solve-field` on one file and wait for it.
///
/// A solver that can't be started, exits unsuccessfully or runs past the
/// timeout is a failed solve, not an error; errors are for problems on our
/// end.
pub fn call_astrometry<P: AsRef<Path>>(path: P, opts: &SolveOptions) -> Result<SolveOutcome> {
    let path = path.as_ref();
    let mut cmd = Command::new(&opts.program);
    cmd.args(opts.args());

    // Has to live until the solver is done with the files in it.
    let _config_dir = if opts.custom_sextractor_config {
        let dir = tempfile::tempdir()?;
        cmd.args(write_sextractor_config(dir.path())?);
        Some(dir)
    } else {
        None
    };

    cmd.arg(path);
    debug!("running {:?}", cmd.as_std());

    let rt = runtime::Builder::new_current_thread().enable_all().build()?;
    let outcome = rt.block_on(run_solver(cmd, opts.timeout));

    if outcome.solved {
        debug!("{}", outcome.diagnostic);
    } else {
        warn!("adding astrometry failed for `{}`", path.display());
    }

    Ok(outcome)
}

/// `a/b.fit` plus `.axy` is `a/b.axy`.
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.with_extension("").into_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[derive(Clone, Debug, Default)]
pub struct AddOptions {
    pub solve: SolveOptions,

    /// Replace the original file with the solved one.
    pub overwrite: bool,

    /// On failure, save what the solver said to `<base>.failed`.
    pub note_failure: bool,

    /// If SExtractor doesn't work, try again with the built-in source
    /// finder.
    pub try_builtin_source_finder: bool,
}

/// Solve one file, first with SExtractor and then, optionally, without.
/// Returns whether it worked.
pub fn add_astrometry<P: AsRef<Path>>(path: P, opts: &AddOptions) -> Result<bool> {
    let path = path.as_ref();
    info!("BEGIN ADDING ASTROMETRY on `{}`", path.display());

    let mut first = opts.solve.clone();

    if first.sextractor == Sextractor::BuiltIn {
        first.sextractor = Sextractor::OnPath;
    }

    let mut outcome = call_astrometry(path, &first)?;

    if !outcome.solved && opts.try_builtin_source_finder {
        info!("astrometry failed using sextractor, trying built-in source finder");

        let second = SolveOptions {
            sextractor: Sextractor::BuiltIn,
            custom_sextractor_config: false,
            overwrite: true,
            ..opts.solve.clone()
        };

        outcome = call_astrometry(path, &second)?;
    }

    let mut solved = outcome.solved;

    if solved {
        info!("adding astrometry succeeded");

        if opts.overwrite {
            info!("overwriting original file with image with astrometry");

            if let Err(e) = fs::rename(sidecar(path, ".new"), path) {
                error!("could not replace `{}`: {}", path.display(), e);
                solved = false;
            }
        }
    }

    // Whether or not it worked, clean up.
    let _ = fs::remove_file(sidecar(path, ".axy"));

    if outcome.solved {
        let _ = fs::remove_file(sidecar(path, "-indx.xyls"));
        let _ = fs::remove_file(sidecar(path, ".solved"));
    }

    if opts.note_failure && !outcome.solved {
        let failed = sidecar(path, ".failed");

        if let Err(e) = fs::write(&failed, &outcome.diagnostic) {
            error!("unable to save solver output to `{}`: {}", failed.display(), e);
        }
    }

    info!("END ADDING ASTROMETRY for `{}`", path.display());
    Ok(solved)
}

#[derive(Clone, Debug, Default)]
pub struct DirectoryOptions {
    /// Work on copies in this directory instead of the originals.
    pub destination: Option<PathBuf>,

    /// Solve files with no pointing information too. This is slow.
    pub blind: bool,

    pub solve: SolveOptions,
    pub try_builtin_source_finder: bool,
}

#[derive(Clone, Debug, Default)]
pub struct AstrometrySummary {
    pub solved: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,

    /// Files skipped for lack of pointing, each marked with a `.blind` file.
    pub needs_blind: Vec<PathBuf>,
}

/// Tidy the header of a freshly solved file. If we didn't have a pointing
/// hint, the solution tells us where the center of the image is.
fn finish_solved_file(path: &Path, had_hint: bool) -> anyhow::Result<()> {
    let mut rec = FitsRecord::open(path)?;
    let hdr = rec.header_mut();

    hdr.remove("IMAGEH");
    hdr.remove("IMAGEW");

    if !had_hint {
        // The reference pixel is the image center, so CRVALn are the
        // center's coordinates, in degrees.
        let ra = hdr.get("CRVAL1").and_then(|v| v.as_f64());
        let dec = hdr.get("CRVAL2").and_then(|v| v.as_f64());

        if let (Some(ra), Some(dec)) = (ra, dec) {
            hdr.set("RA", sexagesimal(ra.rem_euclid(360.) / 15., 2, false));
            hdr.set("DEC", sexagesimal(dec, 2, true));
        }
    }

    rec.write_to(path, true)
}

/// Solve the light frames that don't have a WCS yet in each directory. One
/// file's failure never stops the others.
pub fn astrometry_for_directory<P: AsRef<Path>>(
    directories: &[P],
    opts: &DirectoryOptions,
) -> Result<AstrometrySummary> {
    let mut summary = AstrometrySummary::default();

    for dir in directories {
        let dir = dir.as_ref();
        let index = HeaderIndex::create(dir, &["imagetyp", "object", "wcsaxes", "ra", "dec"])?;
        let table = index.table();

        if table.is_empty() {
            continue;
        }

        let lights = index.filter_rows(&Predicates::new().equals("imagetyp", "LIGHT").missing("wcsaxes"))?;
        let working = opts.destination.as_deref().unwrap_or(dir);
        debug!("about to loop over {} files", lights.len());

        for row in lights {
            let name = table.file(row);
            let target = working.join(name);

            if working != dir {
                if let Err(e) = fs::create_dir_all(working).and_then(|_| fs::copy(dir.join(name), &target)) {
                    error!("could not copy `{}` to `{}`: {}", name, working.display(), e);
                    summary.failed.push(target);
                    continue;
                }
            }

            let hint = match (table.get("ra", row), table.get("dec", row)) {
                (Some(ra), Some(dec)) => Some((ra.to_string(), dec.to_string())),
                _ => None,
            };

            if hint.is_none() && !opts.blind {
                let marker = sidecar(&target, ".blind");

                if let Err(e) = fs::File::create(&marker) {
                    error!("could not create `{}`: {}", marker.display(), e);
                }

                summary.needs_blind.push(target);
                continue;
            }

            let add = AddOptions {
                solve: SolveOptions {
                    ra_dec: hint.clone(),
                    ..opts.solve.clone()
                },
                overwrite: true,
                note_failure: true,
                try_builtin_source_finder: opts.try_builtin_source_finder,
            };

            let solved = match add_astrometry(&target, &add) {
                Ok(s) => s,
                Err(e) => {
                    error!("astrometry on `{}` failed: {}", target.display(), e);
                    false
                }
            };

            if solved {
                if let Err(e) = finish_solved_file(&target, hint.is_some()) {
                    warn!("could not update header of `{}`: {:#}", target.display(), e);
                }

                summary.solved.push(target);
            } else {
                summary.failed.push(target);
            }
        }
    }

    info!(
        "{} solved, {} failed, {} need blind astrometry",
        summary.solved.len(),
        summary.failed.len(),
        summary.needs_blind.len()
    );
    Ok(summary)
}
