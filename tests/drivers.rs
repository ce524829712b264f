mod common;

use common::{five_file_night, text, write_image};
use feder_pipeline::{
    fitsfile::read_header,
    patch::{self, PatchOptions},
    sort::{self, SortOptions},
    triage::{self, TriageOptions},
    Error, MetadataTable, Observatory, Value,
};
use std::{fs, path::Path};

fn list(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_owned)
        .collect()
}

#[test]
fn triage_writes_lists_and_manifest() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    fs::write(dir.path().join("NEEDS_OBJECT_NAME.txt"), "File\nstale.fit\n").unwrap();

    let obs = Observatory::feder();
    let results = triage::triage_directories(&obs, &[dir.path()], &TriageOptions::default()).unwrap();
    let result = &results[0];

    assert_eq!(result.needs_filter, vec!["light3.fit"]);
    assert_eq!(result.needs_object_name, vec!["light2.fit"]);
    assert_eq!(result.needs_astrometry.len(), 3);

    assert_eq!(list(&dir.path().join("NEEDS_FILTER.txt")), vec!["light3.fit"]);
    assert_eq!(list(&dir.path().join("NEEDS_OBJECT_NAME.txt")), vec!["light2.fit"]);

    let manifest = MetadataTable::read_csv(dir.path().join("Manifest.txt")).unwrap();
    assert_eq!(manifest.n_rows(), 5);
    assert!(manifest.has_column("Source directory"));
    assert!(manifest.has_column("imagetyp"));
}

#[test]
fn triage_to_destination_and_all_keywords() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_image(
        dir.path(),
        "a.fit",
        &[
            ("IMAGETYP", text("LIGHT")),
            ("FILTER", text("V")),
            ("OBJECT", text("M13")),
            ("RA", text("16:41:41")),
            ("HA", text("01:00:00")),
            ("WCSAXES", Value::Integer(2)),
            ("FOCUS", Value::Integer(1200)),
        ],
    );

    let opts = TriageOptions {
        all_keywords: true,
        destination: Some(out.path().to_path_buf()),
        ..TriageOptions::default()
    };

    let results = triage::triage_directories(&Observatory::feder(), &[dir.path()], &opts).unwrap();
    let result = &results[0];
    assert!(result.needs_pointing.is_empty());
    assert!(result.needs_astrometry.is_empty());
    assert!(result.table.has_column("focus"));

    // Nothing was needed, so only the manifest is written.
    let written: Vec<_> = fs::read_dir(out.path()).unwrap().collect();
    assert_eq!(written.len(), 1);
    assert!(out.path().join("Manifest.txt").exists());
    assert!(!dir.path().join("Manifest.txt").exists());
}

#[test]
fn triage_refuses_maximdl_image_types() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "a.fit", &[("IMAGETYP", text("Light Frame"))]);

    assert!(matches!(
        triage::triage_fits_files(&Observatory::feder(), dir.path(), &TriageOptions::default()),
        Err(Error::Triage(_))
    ));
}

#[test]
fn sort_builds_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    write_image(
        dir.path(),
        "dark1.fit",
        &[("IMAGETYP", text("DARK")), ("EXPTIME", Value::Float(30.))],
    );
    write_image(dir.path(), "odd.fit", &[("IMAGETYP", text("FOCUS"))]);
    write_image(dir.path(), "untyped.fit", &[]);

    let opts = SortOptions {
        destination: Some(out.path().to_path_buf()),
        move_files: false,
    };

    let placed = sort::sort_directory(dir.path(), &opts).unwrap();
    assert_eq!(placed.len(), 7);

    let o = out.path();
    assert!(o.join("BIAS/bias1.fit").exists());
    assert!(o.join("BIAS/bias2.fit").exists());
    assert!(o.join("DARK/30.0/dark1.fit").exists());
    assert!(o.join("LIGHT/M101/R/30.0/light1.fit").exists());
    assert!(o.join("LIGHT/unsorted/light2.fit").exists());
    assert!(o.join("LIGHT/unsorted/light3.fit").exists());
    assert!(o.join("FOCUS/odd.fit").exists());

    // Copies, not moves.
    assert!(dir.path().join("light1.fit").exists());
}

#[test]
fn sort_can_move() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "b.fit", &[("IMAGETYP", text("BIAS"))]);

    let opts = SortOptions {
        destination: None,
        move_files: true,
    };

    sort::sort_directory(dir.path(), &opts).unwrap();
    assert!(dir.path().join("BIAS/b.fit").exists());
    assert!(!dir.path().join("b.fit").exists());
}

#[test]
fn sort_skips_files_it_cannot_place() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    write_image(
        dir.path(),
        "sneaky.fit",
        &[
            ("IMAGETYP", text("LIGHT")),
            ("OBJECT", text("..")),
            ("FILTER", text("V")),
            ("EXPTIME", Value::Float(5.)),
        ],
    );

    fs::create_dir_all(out.path().join("BIAS")).unwrap();
    fs::write(out.path().join("BIAS/bias1.fit"), b"already here").unwrap();

    let opts = SortOptions {
        destination: Some(out.path().to_path_buf()),
        move_files: true,
    };

    let placed = sort::sort_directory(dir.path(), &opts).unwrap();
    assert_eq!(placed.len(), 5);

    let o = out.path();
    assert_eq!(fs::read(o.join("BIAS/bias1.fit")).unwrap(), b"already here");
    assert!(dir.path().join("bias1.fit").exists());
    assert!(o.join("BIAS/bias2.fit").exists());
    assert!(o.join("LIGHT/M101/R/30.0/light1.fit").exists());
    assert!(o.join("LIGHT/_../V/5.0/sneaky.fit").exists());
    assert!(!o.join("V").exists());
}

fn raw_maximdl_light(dir: &Path, name: &str) {
    write_image(
        dir,
        name,
        &[
            ("SWCREATE", text("MaxIm DL Version 5.21 130912 01A17")),
            ("INSTRUME", text("Apogee Alta")),
            ("IMAGETYP", text("Light Frame")),
            ("DATE-OBS", text("2012-06-27T03:12:30")),
            ("OBSERVER", text("nobody")),
            ("OBJECT", text("M101")),
        ],
    );
}

#[test]
fn patch_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    raw_maximdl_light(dir.path(), "good.fit");
    write_image(dir.path(), "mystery.fit", &[("IMAGETYP", text("Light Frame"))]);

    let opts = PatchOptions {
        suffix: String::new(),
        save_location: Some(out.path().join("patched")),
        ..PatchOptions::default()
    };

    let summary = patch::patch_headers(&Observatory::feder(), dir.path(), &opts).unwrap();
    assert_eq!(summary.patched, vec!["good.fit"]);
    assert_eq!(summary.failed, vec!["mystery.fit"]);

    let hdr = read_header(out.path().join("patched/good.fit")).unwrap();
    assert_eq!(hdr.get_str("IMAGETYP"), Some("LIGHT"));
    assert!(!hdr.contains("OBSERVER"));
    assert!(!hdr.contains("OBJECT"));
    assert_eq!(hdr.get("PURGED"), Some(&Value::Logical(true)));
    assert_eq!(hdr.get_str("BUNIT"), Some("adu"));
    assert_eq!(hdr.get_str("LATITUDE"), Some("+46:52:00.4080"));
    assert_eq!(hdr.get_str("SITELAT"), Some("+46:52:00.4080"));

    let jd = hdr.get("JD-OBS").and_then(|v| v.as_f64()).unwrap();
    assert!((jd - 2456105.63368).abs() < 1e-4);

    let history = hdr.history().join("\n");
    assert!(history.contains("BEGIN patch_headers history"));
    assert!(history.contains("Changed IMAGETYP from Light Frame to LIGHT"));

    // The file that couldn't be patched is saved anyway, with a note.
    let hdr = read_header(out.path().join("patched/mystery.fit")).unwrap();
    assert!(hdr.history().iter().any(|h| h.contains("FILE NOT PATCHED")));
    assert_eq!(hdr.get_str("IMAGETYP"), Some("Light Frame"));

    // The originals are untouched.
    let orig = read_header(dir.path().join("good.fit")).unwrap();
    assert_eq!(orig.get_str("OBSERVER"), Some("nobody"));
}

#[test]
fn add_keys_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_image(dir.path(), "a.fit", &[("IMAGETYP", text("LIGHT"))]);
    let b = write_image(dir.path(), "b.fit", &[("IMAGETYP", text("LIGHT"))]);

    let list = dir.path().join("files.txt");
    fs::write(&list, format!("File\n{}\n{}\n", a.display(), b.display())).unwrap();
    let keys = dir.path().join("keys.txt");
    fs::write(&keys, "Keyword Value\nOBJECT 'M 13'\nEXPTIME 30\n").unwrap();

    let files = patch::read_file_list(&list).unwrap();
    let pairs = patch::read_key_file(&keys).unwrap();
    patch::add_keys(&files, &pairs).unwrap();

    for path in [a, b] {
        let hdr = read_header(path).unwrap();
        assert_eq!(hdr.get_str("OBJECT"), Some("M 13"));
        assert_eq!(hdr.get("EXPTIME"), Some(&Value::Integer(30)));
        assert!(hdr.history().iter().any(|h| h.contains("OBJECT")));
    }
}
