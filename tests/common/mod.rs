//! Helpers for building directories of small FITS images.

#![allow(dead_code)]

use feder_pipeline::{FitsRecord, Value};
use fitsio::{
    images::{ImageDescription, ImageType},
    FitsFile,
};
use std::path::{Path, PathBuf};

/// A 4x3 16-bit image with the given extra header cards.
pub fn write_image(dir: &Path, name: &str, cards: &[(&str, Value)]) -> PathBuf {
    let path = dir.join(name);
    let desc = ImageDescription {
        data_type: ImageType::Short,
        dimensions: &[3, 4],
    };

    {
        let mut f = FitsFile::create(&path).with_custom_primary(&desc).open().unwrap();
        let hdu = f.primary_hdu().unwrap();
        let data: Vec<i16> = (0..12).collect();
        hdu.write_image(&mut f, &data).unwrap();
    }

    let mut rec = FitsRecord::open(&path).unwrap();

    for (k, v) in cards {
        rec.header_mut().set(k, v.clone());
    }

    rec.write_to(&path, true).unwrap();
    path
}

pub fn text(s: &str) -> Value {
    Value::from(s)
}

/// The five-image night: two biases, two R-band lights (one of them without
/// pointing or object), and a light with no filter.
pub fn five_file_night(dir: &Path) {
    write_image(dir, "bias1.fit", &[("IMAGETYP", text("BIAS"))]);
    write_image(dir, "bias2.fit", &[("IMAGETYP", text("BIAS"))]);
    write_image(
        dir,
        "light1.fit",
        &[
            ("IMAGETYP", text("LIGHT")),
            ("FILTER", text("R")),
            ("OBJECT", text("M101")),
            ("RA", text("14:03:12.5")),
            ("DEC", text("+54:20:56")),
            ("EXPTIME", Value::Float(30.)),
        ],
    );
    write_image(
        dir,
        "light2.fit",
        &[
            ("IMAGETYP", text("LIGHT")),
            ("FILTER", text("R")),
            ("EXPTIME", Value::Float(30.)),
        ],
    );
    write_image(
        dir,
        "light3.fit",
        &[
            ("IMAGETYP", text("LIGHT")),
            ("OBJECT", text("M101")),
            ("RA", text("14:03:12.5")),
            ("DEC", text("+54:20:56")),
            ("EXPTIME", Value::Float(60.)),
        ],
    );
}
