mod common;

use common::{five_file_night, text, write_image};
use feder_pipeline::{
    collection::WILDCARD, fitsfile::read_header, Error, GroupingTree, HeaderIndex, IterOptions, MetadataTable, Predicates, Value,
};
use std::{collections::HashSet, fs, io::Read};

#[test]
fn five_file_night_filters() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());

    let index = HeaderIndex::create(dir.path(), &["imagetyp", "filter", "object", "ra"]).unwrap();
    assert_eq!(index.table().n_rows(), 5);
    assert_eq!(index.keywords(), vec!["file", "imagetyp", "filter", "object", "ra"]);

    let no_filter = index
        .filter(&Predicates::new().equals("imagetyp", "light").missing("filter"))
        .unwrap();
    assert_eq!(no_filter, vec!["light3.fit"]);

    let no_object = index
        .filter(&Predicates::new().equals("imagetyp", "light").missing("object"))
        .unwrap();
    assert_eq!(no_object, vec!["light2.fit"]);

    let biases = index.filter(&Predicates::new().equals("imagetyp", "BIAS")).unwrap();
    assert_eq!(biases, vec!["bias1.fit", "bias2.fit"]);
}

#[test]
fn filtering_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    let index = HeaderIndex::create(dir.path(), &["imagetyp", "filter", "object"]).unwrap();

    let p = Predicates::new().equals("imagetyp", "light").missing("object");
    let first = index.filter(&p).unwrap();
    let other = index.filter(&Predicates::new().any("filter")).unwrap();
    assert_eq!(other.len(), 2);
    assert_eq!(index.filter(&p).unwrap(), first);

    // An unknown column is an error, and doesn't disturb anything either.
    assert!(matches!(
        index.filter(&Predicates::new().any("exptime")),
        Err(Error::UnknownKeyword(_))
    ));
    assert_eq!(index.filter(&p).unwrap(), first);
}

#[test]
fn present_and_absent_are_complements() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    let index = HeaderIndex::create(dir.path(), &["filter"]).unwrap();

    let present: HashSet<String> = index.filter(&Predicates::new().any("filter")).unwrap().into_iter().collect();
    let absent: HashSet<String> = index.filter(&Predicates::new().missing("filter")).unwrap().into_iter().collect();

    assert!(present.is_disjoint(&absent));
    assert_eq!(present.len() + absent.len(), 5);
    assert!(present.contains("light1.fit"));
    assert!(absent.contains("bias1.fit"));
}

#[test]
fn trimming_keeps_rows() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    let mut index = HeaderIndex::create(dir.path(), &["imagetyp", "filter", "object"]).unwrap();

    let files: Vec<String> = index.table().files().iter().map(|s| s.to_string()).collect();
    let generation = index.table_generation();

    index.set_keywords(&["imagetyp", "filter"]).unwrap();
    assert_eq!(index.keywords(), vec!["file", "imagetyp", "filter"]);
    assert_eq!(index.table().files(), files);
    assert_eq!(index.table_generation(), generation);

    // Asking for something new means going back to the files.
    index.set_keywords(&["imagetyp", "exptime"]).unwrap();
    assert_eq!(index.table_generation(), generation + 1);
    assert_eq!(index.table().get("exptime", 2), Some(&Value::Float(30.)));
}

#[test]
fn wildcard_takes_everything() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    let index = HeaderIndex::create(dir.path(), &[WILDCARD]).unwrap();

    for col in ["imagetyp", "filter", "object", "ra", "dec", "exptime", "naxis1"] {
        assert!(index.table().has_column(col), "missing column {}", col);
    }

    assert_eq!(index.values("imagetyp", true).unwrap(), vec![text("BIAS"), text("LIGHT")]);
}

#[test]
fn unreadable_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    fs::write(dir.path().join("broken.fit"), b"this is not a FITS file").unwrap();
    fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

    let index = HeaderIndex::create(dir.path(), &["imagetyp"]).unwrap();
    assert_eq!(index.files().len(), 6);
    assert!(index.files().contains(&"broken.fit".to_owned()));
    assert_eq!(index.table().n_rows(), 5);
    assert!(!index.table().files().contains(&"broken.fit"));
}

#[test]
fn mixed_value_kinds_are_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "a.fit", &[("EXPTIME", Value::Float(30.))]);
    write_image(dir.path(), "b.fit", &[("EXPTIME", Value::Integer(30))]);

    // Integers and floats mix happily.
    let index = HeaderIndex::create(dir.path(), &["exptime"]).unwrap();
    assert_eq!(index.values("exptime", true).unwrap().len(), 1);

    write_image(dir.path(), "c.fit", &[("EXPTIME", text("long"))]);

    match HeaderIndex::create(dir.path(), &["exptime"]) {
        Err(Error::TypeMismatch { keyword, file, .. }) => {
            assert_eq!(keyword, "exptime");
            assert_eq!(file, "c.fit");
        }
        other => panic!("expected a type mismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn bad_keyword_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        HeaderIndex::create(dir.path(), &["much-too-long"]),
        Err(Error::InvalidKeyword(_))
    ));
}

#[test]
fn iterate_saves_with_suffix() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    let index = HeaderIndex::create(dir.path(), &["imagetyp"]).unwrap();

    let opts = IterOptions::new()
        .suffix("_new")
        .filter(Predicates::new().equals("imagetyp", "bias"));

    let mut seen = 0;

    for mut rec in index.iterate(opts.clone()).unwrap() {
        assert_eq!(rec.pixels().unwrap().len(), 12);
        rec.header_mut().set("SEEN", 1);
        seen += 1;
    }

    assert_eq!(seen, 2);

    let saved = read_header(dir.path().join("bias1_new.fit")).unwrap();
    assert_eq!(saved.get("SEEN"), Some(&Value::Integer(1)));

    let original = read_header(dir.path().join("bias1.fit")).unwrap();
    assert!(!original.contains("SEEN"));
    assert!(!dir.path().join("light1_new.fit").exists());

    // A second pass must not clobber the first pass's output.
    for mut rec in index.iterate(opts).unwrap() {
        rec.header_mut().set("SEEN", 2);
    }

    let saved = read_header(dir.path().join("bias1_new.fit")).unwrap();
    assert_eq!(saved.get("SEEN"), Some(&Value::Integer(1)));
}

#[test]
fn iterate_to_another_directory() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    let index = HeaderIndex::create(dir.path(), &["imagetyp"]).unwrap();

    for mut rec in index.iterate(IterOptions::new().location(out.path())).unwrap() {
        assert_eq!(rec.destination(), Some(out.path().join(rec.file_name()).as_path()));
        let px = rec.pixels().unwrap();
        assert_eq!(px.shape(), &[3, 4]);
        rec.header_mut().set("MOVED", true);

        if rec.file_name() == "light2.fit" {
            rec.discard();
        } else {
            rec.save().unwrap();
        }
    }

    let written: HashSet<String> = fs::read_dir(out.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(written.len(), 4);
    assert!(!written.contains("light2.fit"));

    // Saving again explicitly reports the clash.
    let rec = index.iterate(IterOptions::new().location(out.path())).unwrap().next().unwrap();
    assert!(rec.save().is_err());
}

#[test]
fn iterate_in_place_needs_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_image(dir.path(), "a.fit", &[("IMAGETYP", text("LIGHT"))]);
    let index = HeaderIndex::create(dir.path(), &["imagetyp"]).unwrap();

    // No suffix, no location, no overwrite: nothing to save.
    for mut rec in index.iterate(IterOptions::new()).unwrap() {
        assert_eq!(rec.destination(), None);
        rec.header_mut().set("OBJECT", "M13");
    }
    assert!(!read_header(&path).unwrap().contains("OBJECT"));

    for mut rec in index.iterate(IterOptions::new().overwrite(true)).unwrap() {
        rec.header_mut().set("OBJECT", "M13");
    }
    assert_eq!(read_header(&path).unwrap().get_str("OBJECT"), Some("M13"));
}

#[test]
fn gzipped_images() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "c.fit.gz", &[("IMAGETYP", text("DARK"))]);
    write_image(dir.path(), "d.fits", &[("IMAGETYP", text("DARK"))]);

    let index = HeaderIndex::create(dir.path(), &["imagetyp"]).unwrap();
    assert_eq!(index.table().files(), vec!["c.fit.gz", "d.fits"]);

    for mut rec in index.iterate(IterOptions::new().suffix("_new")).unwrap() {
        rec.header_mut().set("EXPTIME", 10);
    }

    let raw = fs::read(dir.path().join("c_new.fit.gz")).unwrap();
    assert_eq!(&raw[..2], &[0x1f, 0x8b]);

    let mut start = [0u8; 9];
    flate2::read::GzDecoder::new(&raw[..]).read_exact(&mut start).unwrap();
    assert_eq!(&start, b"SIMPLE  =");

    assert!(dir.path().join("d_new.fits").exists());
}

#[test]
fn grouping_partitions_the_table() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    let index = HeaderIndex::create(dir.path(), &["imagetyp", "exptime"]).unwrap();
    let table = index.table();

    let tree = GroupingTree::build_filled(table, &(0..table.n_rows()).collect::<Vec<_>>(), &["imagetyp", "exptime"], "file")
        .unwrap();

    let mut all = Vec::new();

    for step in tree.walk() {
        all.extend(step.ids.iter().filter_map(|v| v.as_str()).map(str::to_owned));
    }

    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 5);
    assert_eq!(unique.len(), 5);

    assert!(matches!(
        GroupingTree::build(table, &["exptime"], "imagetyp"),
        Err(Error::NonUniqueIndex { .. })
    ));
}

#[test]
fn grouping_keeps_rows_with_missing_keys() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    let index = HeaderIndex::create(dir.path(), &["imagetyp", "filter"]).unwrap();

    let tree = GroupingTree::build(index.table(), &["imagetyp", "filter"], "file").unwrap();

    let mut groups: Vec<(Vec<Option<String>>, Vec<String>)> = tree
        .walk()
        .filter(|s| s.children.is_empty())
        .map(|s| {
            (
                s.parents.iter().map(|p| p.map(|v| v.to_string())).collect(),
                s.ids.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect();
    groups.sort();

    assert_eq!(
        groups,
        vec![
            (
                vec![Some("BIAS".to_owned()), None],
                vec!["bias1.fit".to_owned(), "bias2.fit".to_owned()]
            ),
            (vec![Some("LIGHT".to_owned()), None], vec!["light3.fit".to_owned()]),
            (
                vec![Some("LIGHT".to_owned()), Some("R".to_owned())],
                vec!["light1.fit".to_owned(), "light2.fit".to_owned()]
            ),
        ]
    );
}

#[test]
fn manifest_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    five_file_night(dir.path());
    write_image(dir.path(), "blank.fit", &[("IMAGETYP", text("LIGHT")), ("OBJECT", text(""))]);

    let index = HeaderIndex::create(dir.path(), &["imagetyp", "object", "exptime"]).unwrap();
    let csv_path = dir.path().join("table.csv");
    index.table().write_csv(&csv_path).unwrap();

    let back = MetadataTable::read_csv(&csv_path).unwrap();
    assert_eq!(&back, index.table());

    let row = back.files().iter().position(|f| *f == "blank.fit").unwrap();
    assert_eq!(back.get("object", row), Some(&text("")));
    assert_eq!(back.get("exptime", row), None);
}
