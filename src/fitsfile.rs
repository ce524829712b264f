//! FITS images on disk, through CFITSIO.
//!
//! Opening files and reading pixels goes through the [`fitsio`] API. It has
//! nothing for enumerating every card of a header or rewriting one wholesale,
//! so for those we drop down to the raw CFITSIO calls in [`fitsio::sys`].
//! CFITSIO also takes care of gzip: compressed files are read transparently,
//! and a file created with a name ending in `.gz` is compressed on close.

use anyhow::{bail, Context, Result};
use fitsio::{hdu::HduInfo, sys, FitsFile};
use ndarray::{ArrayD, IxDyn};
use std::{
    ffi::{CStr, CString},
    os::raw::{c_char, c_int, c_longlong},
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::{
    header::{Card, Header},
    value::Value,
};

// Internal CFITSIO routines (declared in fitsio2.h) that fitsio-sys does not
// bind; they are still exported by the bundled library.
mod cfitsio_ext {
    use std::os::raw::{c_char, c_int};

    extern "C" {
        pub fn ffc2s(instr: *const c_char, outstr: *mut c_char, status: *mut c_int) -> c_int;
        pub fn ffc2dd(cval: *const c_char, dval: *mut f64, status: *mut c_int) -> c_int;
    }
}

// Buffer sizes from fitsio.h, including the terminating NUL.
const FLEN_CARD: usize = 81;
const FLEN_KEYWORD: usize = 75;
const FLEN_VALUE: usize = 71;
const FLEN_COMMENT: usize = 73;
const FLEN_ERRMSG: usize = 81;

/// Significant digits when CFITSIO formats a float value.
const FLOAT_DIGITS: c_int = 15;

/// CFITSIO signals errors through status codes.
macro_rules! try_cfitsio {
    ($status:expr) => {{
        let s = $status;

        if s != 0 {
            bail!("cfitsio error {}: {}", s, error_text(s));
        }
    }};
}

fn error_text(status: c_int) -> String {
    let mut buf = [0 as c_char; FLEN_ERRMSG];

    unsafe {
        sys::ffgerr(status, buf.as_mut_ptr());
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().trim().to_owned()
    }
}

fn c_text(buf: &[c_char]) -> String {
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Keywords that describe the data unit. CFITSIO writes these itself when it
/// copies an HDU, so we never touch them.
fn is_structural(keyword: &str) -> bool {
    match keyword {
        "SIMPLE" | "XTENSION" | "BITPIX" | "NAXIS" | "EXTEND" | "PCOUNT" | "GCOUNT"
        | "BZERO" | "BSCALE" | "BLANK" => true,
        k => k
            .strip_prefix("NAXIS")
            .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false),
    }
}

/// Parse text in FITS value syntax. CFITSIO decides what kind of value it is
/// and does the unquoting; blank text is the undefined value.
pub fn parse_value_string(text: &str) -> Result<Option<Value>> {
    let text = text.trim();

    if text.is_empty() {
        return Ok(None);
    }

    let cval = CString::new(text)?;
    let mut dtype: c_char = 0;
    let mut status = 0;

    try_cfitsio!(unsafe { sys::ffdtyp(cval.as_ptr(), &mut dtype, &mut status) });

    match dtype as u8 {
        b'C' => {
            let mut out = vec![0 as c_char; text.len() + 1];
            try_cfitsio!(unsafe { cfitsio_ext::ffc2s(cval.as_ptr(), out.as_mut_ptr(), &mut status) });
            Ok(Some(Value::Text(c_text(&out))))
        }

        // CFITSIO only looks at the first character here.
        b'L' => match text {
            "T" => Ok(Some(Value::Logical(true))),
            "F" => Ok(Some(Value::Logical(false))),
            _ => bail!("`{}` is not a FITS logical value", text),
        },

        // Integers too big for an i64 are kept as floats.
        b'I' => match text.parse::<i64>() {
            Ok(i) => Ok(Some(Value::Integer(i))),
            Err(_) => Ok(Some(Value::Float(to_double(&cval)?))),
        },

        b'F' => Ok(Some(Value::Float(to_double(&cval)?))),

        other => bail!("unsupported FITS value `{}` (type `{}`)", text, other as char),
    }
}

fn to_double(cval: &CStr) -> Result<f64> {
    let mut x = 0.;
    let mut status = 0;
    try_cfitsio!(unsafe { cfitsio_ext::ffc2dd(cval.as_ptr(), &mut x, &mut status) });
    Ok(x)
}

/// Turn one card image from CFITSIO into our representation.
fn parse_card(card: &mut [c_char; FLEN_CARD]) -> Result<Card> {
    let mut name = [0 as c_char; FLEN_KEYWORD];
    let mut value = [0 as c_char; FLEN_VALUE];
    let mut comment = [0 as c_char; FLEN_COMMENT];
    let mut len: c_int = 0;
    let mut status = 0;

    try_cfitsio!(unsafe { sys::ffgknm(card.as_mut_ptr(), name.as_mut_ptr(), &mut len, &mut status) });

    let keyword = c_text(&name).trim().to_uppercase();
    let image = c_text(&card[..]);

    if matches!(keyword.as_str(), "COMMENT" | "HISTORY" | "") {
        let text = image.get(8..).unwrap_or("").trim_end().to_owned();
        return Ok(Card::Commentary { keyword, text });
    }

    try_cfitsio!(unsafe {
        sys::ffpsvc(
            card.as_mut_ptr(),
            value.as_mut_ptr(),
            comment.as_mut_ptr(),
            &mut status,
        )
    });

    let value = c_text(&value);
    let comment = c_text(&comment).trim().to_owned();

    // A keyword with no value indicator, e.g. CONTINUE.
    if value.trim().is_empty() && !keyword.starts_with("HIERARCH") && image.get(8..10) != Some("= ") {
        let text = image.get(8..).unwrap_or("").trim_end().to_owned();
        return Ok(Card::Commentary { keyword, text });
    }

    let value = match parse_value_string(&value) {
        Ok(v) => v,
        Err(e) => {
            debug!("keeping odd value of {} as text: {:#}", keyword, e);
            Some(Value::Text(value.trim().to_owned()))
        }
    };

    Ok(Card::Keyed {
        keyword,
        value,
        comment: if comment.is_empty() { None } else { Some(comment) },
    })
}

fn read_record(handle: *mut sys::fitsfile, nrec: c_int) -> Result<[c_char; FLEN_CARD]> {
    let mut card = [0 as c_char; FLEN_CARD];
    let mut status = 0;
    try_cfitsio!(unsafe { sys::ffgrec(handle, nrec, card.as_mut_ptr(), &mut status) });
    Ok(card)
}

fn key_count(handle: *mut sys::fitsfile) -> Result<c_int> {
    let mut nexist: c_int = 0;
    let mut nmore: c_int = 0;
    let mut status = 0;
    try_cfitsio!(unsafe { sys::ffghsp(handle, &mut nexist, &mut nmore, &mut status) });
    Ok(nexist)
}

/// Read every card of the current HDU.
fn read_cards(fits: &mut FitsFile) -> Result<Header> {
    let handle = unsafe { fits.as_raw() };
    let n = key_count(handle)?;
    let mut cards = Vec::with_capacity(n as usize);

    for i in 1..=n {
        let mut card = read_record(handle, i)?;
        cards.push(parse_card(&mut card)?);
    }

    Ok(Header::from_cards(cards))
}

/// Read just the primary header of a FITS file, possibly gzipped.
pub fn read_header<P: AsRef<Path>>(path: P) -> Result<Header> {
    let path = path.as_ref();
    let mut fits =
        FitsFile::open(path).with_context(|| format!("failed to open `{}`", path.display()))?;
    read_cards(&mut fits).with_context(|| format!("failed to read header of `{}`", path.display()))
}

/// Number of pixels in an image of this shape.
fn pixel_count(shape: &[usize]) -> Result<usize> {
    shape.iter().try_fold(1usize, |n, &d| match n.checked_mul(d) {
        Some(n) => Ok(n),
        None => bail!("image dimensions {:?} are too large", shape),
    })
}

/// A new file that we create and fill through the raw CFITSIO interface.
/// It is closed when dropped, but [`OutputFile::close`] reports errors.
struct OutputFile {
    handle: *mut sys::fitsfile,
}

impl OutputFile {
    fn create(path: &Path) -> Result<Self> {
        let path = path
            .to_str()
            .with_context(|| format!("path `{}` is not valid UTF-8", path.display()))?;

        // The leading `!` tells CFITSIO to replace any existing file.
        let name = CString::new(format!("!{}", path))?;
        let mut handle = std::ptr::null_mut();
        let mut status = 0;

        try_cfitsio!(unsafe { sys::ffinit(&mut handle, name.as_ptr(), &mut status) });
        Ok(OutputFile { handle })
    }

    /// Copy the current HDU of `src`, header and data, as our primary HDU.
    fn copy_from(&mut self, src: &mut FitsFile) -> Result<()> {
        let mut status = 0;
        try_cfitsio!(unsafe { sys::ffcopy(src.as_raw(), self.handle, 0, &mut status) });
        Ok(())
    }

    /// Replace every non-structural card with those of `header`, in order.
    fn replace_header(&mut self, header: &Header) -> Result<()> {
        let mut status = 0;

        for i in (1..=key_count(self.handle)?).rev() {
            let card = read_record(self.handle, i)?;
            let image = c_text(&card);
            let keyword = image.get(..8).unwrap_or(&image).trim_end();

            if !is_structural(keyword) {
                try_cfitsio!(unsafe { sys::ffdrec(self.handle, i, &mut status) });
            }
        }

        for card in header.cards() {
            match card {
                Card::Keyed { keyword, .. } if is_structural(keyword) => {}

                Card::Keyed {
                    keyword,
                    value,
                    comment,
                } => self.put_key(keyword, value.as_ref(), comment.as_deref())?,

                Card::Commentary { keyword, text } => match keyword.as_str() {
                    "HISTORY" => {
                        let text = CString::new(text.as_str())?;
                        try_cfitsio!(unsafe { sys::ffphis(self.handle, text.as_ptr(), &mut status) });
                    }

                    "COMMENT" => {
                        let text = CString::new(text.as_str())?;
                        try_cfitsio!(unsafe { sys::ffpcom(self.handle, text.as_ptr(), &mut status) });
                    }

                    _ => {
                        let image = CString::new(format!("{:<8}{}", keyword, text))?;
                        try_cfitsio!(unsafe { sys::ffprec(self.handle, image.as_ptr(), &mut status) });
                    }
                },
            }
        }

        Ok(())
    }

    fn put_key(&mut self, keyword: &str, value: Option<&Value>, comment: Option<&str>) -> Result<()> {
        let key = CString::new(keyword)?;
        let comment = comment.map(CString::new).transpose()?;
        let comm = comment.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());
        let h = self.handle;
        let mut status = 0;

        match value {
            None => try_cfitsio!(unsafe { sys::ffpkyu(h, key.as_ptr(), comm, &mut status) }),

            Some(Value::Text(s)) => {
                let s = CString::new(s.as_str())?;
                try_cfitsio!(unsafe { sys::ffpkys(h, key.as_ptr(), s.as_ptr(), comm, &mut status) });
            }

            Some(Value::Integer(i)) => try_cfitsio!(unsafe {
                sys::ffpkyj(h, key.as_ptr(), *i as c_longlong, comm, &mut status)
            }),

            // A negative digit count asks for %G-style formatting.
            Some(Value::Float(x)) => try_cfitsio!(unsafe {
                sys::ffpkyd(h, key.as_ptr(), *x, -FLOAT_DIGITS, comm, &mut status)
            }),

            Some(Value::Logical(b)) => try_cfitsio!(unsafe {
                sys::ffpkyl(h, key.as_ptr(), *b as c_int, comm, &mut status)
            }),
        }

        Ok(())
    }

    /// Close the file, flushing it (and compressing it, for `.gz` names).
    fn close(mut self) -> Result<()> {
        let mut status = 0;
        let handle = std::mem::replace(&mut self.handle, std::ptr::null_mut());
        try_cfitsio!(unsafe { sys::ffclos(handle, &mut status) });
        Ok(())
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        let mut status = 0;

        if !self.handle.is_null() {
            unsafe {
                sys::ffclos(self.handle, &mut status);
            }
            self.handle = std::ptr::null_mut();
        }
    }
}

/// A FITS image as the pipeline sees it: an editable copy of the primary
/// header, and the file it came from. Pixels stay on disk until asked for.
#[derive(Clone, Debug)]
pub struct FitsRecord {
    source: PathBuf,
    header: Header,
}

impl FitsRecord {
    /// Open a FITS file, possibly gzipped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = path.as_ref().to_path_buf();
        let header = read_header(&source)?;
        Ok(FitsRecord { source, header })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn header_int(&self, key: &str) -> Result<i64> {
        self.header
            .get(key)
            .and_then(|v| v.as_i64())
            .with_context(|| format!("missing or non-integer {} keyword", key))
    }

    /// Get the dimensions of the image, as the header has them now. These
    /// are reversed from FITS/Fortran order to standard C order: (height,
    /// width) rather than (width, height).
    pub fn dimensions(&self) -> Result<Vec<usize>> {
        let naxis = self.header_int("NAXIS")?;

        if !(0..=999).contains(&naxis) {
            bail!("illegal NAXIS value {}", naxis);
        }

        let mut dims = Vec::with_capacity(naxis as usize);

        for i in (1..=naxis).rev() {
            let n = self.header_int(&format!("NAXIS{}", i))?;

            if n < 0 {
                bail!("illegal NAXIS{} value {}", i, n);
            }

            dims.push(n as usize);
        }

        Ok(dims)
    }

    /// Read the primary image from disk as physical values (CFITSIO applies
    /// `BSCALE` and `BZERO`). An image with no axes comes back as an empty
    /// array.
    pub fn pixels(&self) -> Result<ArrayD<f64>> {
        let mut fits = FitsFile::open(&self.source)
            .with_context(|| format!("failed to open `{}`", self.source.display()))?;
        let hdu = fits.primary_hdu()?;

        let shape = match &hdu.info {
            HduInfo::ImageInfo { shape, .. } => shape.clone(),
            _ => bail!("primary HDU of `{}` is not an image", self.source.display()),
        };

        if shape.is_empty() || pixel_count(&shape)? == 0 {
            return Ok(ArrayD::zeros(IxDyn(&[0])));
        }

        let values: Vec<f64> = hdu.read_image(&mut fits)?;
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
    }

    /// Write the source file's data with our header to `path`. The file is
    /// staged next to its destination and renamed into place, so `path` may
    /// be the source itself.
    pub fn write_to<P: AsRef<Path>>(&self, path: P, overwrite: bool) -> Result<()> {
        let dest = path.as_ref();

        if !overwrite && dest.exists() {
            bail!("refusing to overwrite existing file `{}`", dest.display());
        }

        let dir = match dest.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };

        let name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("bad destination file name `{}`", dest.display()))?;

        // CFITSIO decides on compression from the name, so keep it at the end.
        let staged = tempfile::Builder::new()
            .prefix(".staging-")
            .suffix(&format!("-{}", name))
            .tempfile_in(dir)
            .with_context(|| format!("failed to create a file in `{}`", dir.display()))?
            .into_temp_path();

        {
            let mut src = FitsFile::open(&self.source)
                .with_context(|| format!("failed to open `{}`", self.source.display()))?;
            let mut out = OutputFile::create(&staged)?;
            out.copy_from(&mut src)?;
            out.replace_header(&self.header)?;
            out.close()?;
        }

        staged
            .persist(dest)
            .with_context(|| format!("failed to move new file into `{}`", dest.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitsio::images::{ImageDescription, ImageType};

    fn image(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let desc = ImageDescription {
            data_type: ImageType::Short,
            dimensions: &[2, 3],
        };
        let mut f = FitsFile::create(&path).with_custom_primary(&desc).open().unwrap();
        let hdu = f.primary_hdu().unwrap();
        let data: Vec<i16> = vec![-2, -1, 0, 1, 2, 300];
        hdu.write_image(&mut f, &data).unwrap();
        path
    }

    #[test]
    fn value_strings() {
        assert_eq!(parse_value_string("'M 13  '").unwrap(), Some(Value::from("M 13")));
        assert_eq!(parse_value_string("F").unwrap(), Some(Value::Logical(false)));
        assert_eq!(parse_value_string("42").unwrap(), Some(Value::Integer(42)));
        assert_eq!(parse_value_string("-1.25E-3").unwrap(), Some(Value::Float(-1.25e-3)));
        assert_eq!(parse_value_string("").unwrap(), None);
        assert!(parse_value_string("Tom").is_err());
        assert!(parse_value_string("M13").is_err());
    }

    #[test]
    fn structural_keywords() {
        assert!(is_structural("NAXIS"));
        assert!(is_structural("NAXIS2"));
        assert!(is_structural("BZERO"));
        assert!(!is_structural("NAXISX"));
        assert!(!is_structural("IMAGETYP"));
    }

    #[test]
    fn header_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = image(dir.path(), "a.fit");

        let mut rec = FitsRecord::open(&path).unwrap();
        assert_eq!(rec.dimensions().unwrap(), vec![2, 3]);

        let hdr = rec.header_mut();
        hdr.set("OBJECT", "O'Brien's field");
        hdr.set_with_comment("EXPTIME", 30.0, "seconds");
        hdr.set("SEQNUM", 12);
        hdr.set("PURGED", true);
        hdr.add_history("made by a test");
        rec.write_to(&path, true).unwrap();

        let back = read_header(&path).unwrap();
        assert_eq!(back.get_str("OBJECT"), Some("O'Brien's field"));
        assert_eq!(back.get("EXPTIME"), Some(&Value::Float(30.)));
        assert_eq!(back.get("SEQNUM"), Some(&Value::Integer(12)));
        assert_eq!(back.get("PURGED"), Some(&Value::Logical(true)));
        assert_eq!(back.history(), vec!["made by a test"]);
        assert_eq!(back.get("NAXIS1"), Some(&Value::Integer(3)));

        match back.cards().iter().find(|c| c.keyword() == "EXPTIME") {
            Some(Card::Keyed { comment, .. }) => assert_eq!(comment.as_deref(), Some("seconds")),
            other => panic!("unexpected card {:?}", other),
        }

        // Removing a keyword removes it from disk too.
        let mut rec = FitsRecord::open(&path).unwrap();
        rec.header_mut().remove("SEQNUM");
        rec.write_to(&path, true).unwrap();
        assert!(!read_header(&path).unwrap().contains("SEQNUM"));
    }

    #[test]
    fn pixels_survive_a_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = image(dir.path(), "a.fit");
        let out = dir.path().join("b.fit");

        let mut rec = FitsRecord::open(&path).unwrap();
        rec.header_mut().set("FILTER", "R");
        rec.write_to(&out, false).unwrap();
        assert!(rec.write_to(&out, false).is_err());

        let px = FitsRecord::open(&out).unwrap().pixels().unwrap();
        assert_eq!(px.shape(), &[2, 3]);
        assert_eq!(px[[0, 0]], -2.);
        assert_eq!(px[[1, 2]], 300.);
    }

    #[test]
    fn oversized_images_are_refused() {
        assert_eq!(pixel_count(&[2, 3, 4]).unwrap(), 24);
        assert_eq!(pixel_count(&[]).unwrap(), 1);
        assert!(pixel_count(&[usize::MAX, 2]).is_err());
    }
}
