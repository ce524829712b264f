//! The `feder` command-line tool
//!
//! One subcommand per pipeline step. The usual order of business for a night
//! of images is `patch`, then `astrometry`, then `triage` to see what still
//! needs fixing by hand, and finally `sort`.
//!
//! Unless a destination directory is given, `patch` and `astrometry` modify
//! the images in place.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, time::Duration};
use tracing::{info, Level};

use feder_pipeline::{
    astrometry::{self, DirectoryOptions, SolveOptions},
    init_logging,
    patch::{self, PatchOptions},
    sort::{self, SortOptions},
    triage::{self, OutputNames, TriageOptions, DEFAULT_KEYWORDS},
    Observatory,
};

#[derive(Parser)]
#[command(name = "feder", version, about = "Header processing for Feder Observatory images")]
struct Cli {
    /// Log more detail.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// JSON observatory profile to use instead of the built-in Feder one.
    #[arg(long, global = true, env = "FEDER_PROFILE")]
    profile: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DirArgs {
    /// Directories of FITS images. Subdirectories are not processed.
    #[arg(required = true)]
    dirs: Vec<PathBuf>,

    /// Write results here instead of into each image directory.
    #[arg(short, long = "destination-dir")]
    destination: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Make lists of the images that are missing information.
    Triage {
        #[command(flatten)]
        dirs: DirArgs,

        /// Keyword to put in the manifest; may be repeated. Replaces the
        /// default list.
        #[arg(short, long = "key")]
        keys: Vec<String>,

        /// Put every keyword found in any header in the manifest.
        #[arg(short, long)]
        all: bool,

        /// Print the default keywords and exit.
        #[arg(short, long = "list-default")]
        list_default: bool,

        #[arg(short, long = "table-name", default_value = "Manifest.txt")]
        table_name: String,

        #[arg(short, long = "object-needed-list", default_value = "NEEDS_OBJECT_NAME.txt")]
        object_needed_list: String,

        #[arg(short, long = "pointing-needed-list", default_value = "NEEDS_POINTING_INFO.txt")]
        pointing_needed_list: String,

        #[arg(short, long = "filter-needed-list", default_value = "NEEDS_FILTER.txt")]
        filter_needed_list: String,

        #[arg(short = 'y', long = "astrometry-needed-list", default_value = "NEEDS_ASTROMETRY.txt")]
        astrometry_needed_list: String,
    },

    /// Copy (or move) images into a tree by type, object, filter and
    /// exposure time.
    Sort {
        #[command(flatten)]
        dirs: DirArgs,

        /// Move files instead of copying them.
        #[arg(short, long = "move")]
        move_files: bool,
    },

    /// Fix up image headers: image types, bad keywords, time and site
    /// information, overscan.
    Patch {
        #[command(flatten)]
        dirs: DirArgs,

        /// Only add overscan keywords.
        #[arg(long)]
        overscan_only: bool,

        /// Redo the cleanup of bad keywords even if it has been done.
        #[arg(long)]
        force_purge: bool,
    },

    /// Add WCS information to light frames with astrometry.net.
    Astrometry {
        #[command(flatten)]
        dirs: DirArgs,

        /// Also solve images with no pointing information. This is slow.
        #[arg(short, long)]
        blind: bool,

        /// Use our own SExtractor settings.
        #[arg(short, long)]
        custom_sextractor: bool,

        /// Odds ratio for accepting a match.
        #[arg(short, long)]
        odds_ratio: Option<String>,

        /// Configuration file for the astrometry engine.
        #[arg(long)]
        astrometry_config: Option<PathBuf>,

        /// Camera name, which sets the plate scale (celestron, u9, cp16).
        #[arg(long)]
        camera: Option<String>,

        /// Retry with the built-in source finder if SExtractor fails.
        #[arg(long)]
        try_builtin: bool,

        /// Give up on a single solve after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Set keyword values in a list of files, in place.
    AddKeys {
        /// Files to modify.
        files: Vec<PathBuf>,

        /// File listing more files to modify, under a `File` header line.
        #[arg(long)]
        file_list: Option<PathBuf>,

        /// File of `KEYWORD value` lines, after a header line.
        #[arg(long, required_unless_present = "key_value", conflicts_with = "key_value")]
        key_file: Option<PathBuf>,

        /// A single keyword and value.
        #[arg(long, num_args = 2, value_names = ["KEYWORD", "VALUE"])]
        key_value: Option<Vec<String>>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::WARN
    } else {
        Level::INFO
    };

    init_logging(level);

    let obs = match &cli.profile {
        Some(p) => Observatory::from_json_file(p)?,
        None => Observatory::feder(),
    };

    match cli.command {
        Commands::Triage {
            dirs,
            keys,
            all,
            list_default,
            table_name,
            object_needed_list,
            pointing_needed_list,
            filter_needed_list,
            astrometry_needed_list,
        } => {
            if list_default {
                for k in DEFAULT_KEYWORDS {
                    println!("{}", k);
                }
                return Ok(());
            }

            let opts = TriageOptions {
                keywords: keys,
                all_keywords: all,
                destination: dirs.destination,
                names: OutputNames {
                    object: Some(object_needed_list),
                    pointing: Some(pointing_needed_list),
                    filter: Some(filter_needed_list),
                    astrometry: Some(astrometry_needed_list),
                    manifest: Some(table_name),
                },
            };

            triage::triage_directories(&obs, &dirs.dirs, &opts)?;
        }

        Commands::Sort { dirs, move_files } => {
            for dir in &dirs.dirs {
                let opts = SortOptions {
                    destination: dirs.destination.clone(),
                    move_files,
                };

                sort::sort_directory(dir, &opts)
                    .with_context(|| format!("failed to sort `{}`", dir.display()))?;
            }
        }

        Commands::Patch {
            dirs,
            overscan_only,
            force_purge,
        } => {
            let mut opts = PatchOptions {
                suffix: String::new(),
                force_purge,
                ..PatchOptions::default()
            };

            match &dirs.destination {
                Some(d) => opts.save_location = Some(d.clone()),
                None => opts.overwrite = true,
            }

            if overscan_only {
                opts.purge_bad = false;
                opts.add_time = false;
                opts.fix_imagetype = false;
                opts.add_unit = false;
            }

            for dir in &dirs.dirs {
                let summary = patch::patch_headers(&obs, dir, &opts)?;

                if !summary.failed.is_empty() {
                    info!("{} files in `{}` could not be patched", summary.failed.len(), dir.display());
                }
            }
        }

        Commands::Astrometry {
            dirs,
            blind,
            custom_sextractor,
            odds_ratio,
            astrometry_config,
            camera,
            try_builtin,
            timeout,
        } => {
            let mut solve = SolveOptions {
                custom_sextractor_config: custom_sextractor,
                odds_ratio,
                config: astrometry_config,
                timeout: timeout.map(Duration::from_secs),
                ..SolveOptions::default()
            };

            if let Some(c) = &camera {
                solve = solve.camera(c)?;
            }

            let opts = DirectoryOptions {
                destination: dirs.destination,
                blind,
                solve,
                try_builtin_source_finder: try_builtin,
            };

            astrometry::astrometry_for_directory(&dirs.dirs, &opts)?;
        }

        Commands::AddKeys {
            mut files,
            file_list,
            key_file,
            key_value,
        } => {
            if let Some(list) = file_list {
                files.extend(patch::read_file_list(list)?);
            }

            if files.is_empty() {
                bail!("no files given to add keys to");
            }

            let pairs = match (key_file, key_value) {
                (Some(f), _) => patch::read_key_file(f)?,
                (None, Some(kv)) if kv.len() == 2 => vec![(kv[0].clone(), patch::parse_user_value(&kv[1]))],
                _ => bail!("need either --key-file or --key-value"),
            };

            patch::add_keys(&files, &pairs)?;
        }
    }

    Ok(())
}
