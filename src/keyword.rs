//! Header keywords that may go by several names.
//!
//! Different acquisition programs write the same quantity under different
//! keywords (`RA` vs. `OBJCTRA`, say). A [`Keyword`] bundles a canonical name
//! with its synonyms so that lookups and updates can treat them as one.

use crate::{header::Header, value::Value};
use std::fmt;

use crate::error::{Error, Result};

/// Longest keyword that fits in the keyword field of a header card.
pub const MAX_KEYWORD_LEN: usize = 8;

/// Check that a name can be used as a header keyword and return its canonical
/// (uppercase) form.
pub fn canonical_name<S: AsRef<str>>(name: S) -> Result<String> {
    let name = name.as_ref().trim();

    let ok = !name.is_empty()
        && name.len() <= MAX_KEYWORD_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if !ok {
        return Err(Error::InvalidKeyword(name.to_owned()));
    }

    Ok(name.to_uppercase())
}

#[derive(Clone, Debug, PartialEq)]
pub struct Keyword {
    name: String,
    synonyms: Vec<String>,
    value: Option<Value>,
    comment: Option<String>,
}

impl Keyword {
    /// Create a keyword with no synonyms.
    pub fn new<S: AsRef<str>>(name: S) -> Result<Self> {
        Self::make(name, std::iter::empty::<&str>())
    }

    /// Create a keyword with synonyms. Every name is validated; synonyms are
    /// deduplicated and never include the canonical name.
    pub fn make<S, I, T>(name: S, synonyms: I) -> Result<Self>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut kw = Keyword {
            name: canonical_name(name)?,
            synonyms: Vec::new(),
            value: None,
            comment: None,
        };
        kw.set_synonyms(synonyms)?;
        Ok(kw)
    }

    pub fn with_comment<S: Into<String>>(mut self, comment: S) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_value<V: Into<Value>>(mut self, value: V) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the keyword. The synonym list is filtered again in case the new
    /// name was one of them.
    pub fn set_name<S: AsRef<str>>(&mut self, name: S) -> Result<()> {
        self.name = canonical_name(name)?;
        let name = &self.name;
        self.synonyms.retain(|s| s != name);
        Ok(())
    }

    pub fn synonyms(&self) -> &[String] {
        &self.synonyms
    }

    pub fn set_synonyms<I, T>(&mut self, synonyms: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut new = Vec::new();

        for syn in synonyms {
            let syn = canonical_name(syn)?;

            if syn != self.name && !new.contains(&syn) {
                new.push(syn);
            }
        }

        self.synonyms = new;
        Ok(())
    }

    /// The canonical name followed by the synonyms.
    pub fn names(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.synonyms.iter().map(|s| s.as_str()))
            .collect()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn set_value<V: Into<Value>>(&mut self, value: V) {
        self.value = Some(value.into());
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn history_comment(&self) -> String {
        self.history_comment_for(&self.name)
    }

    fn history_comment_for(&self, name: &str) -> String {
        let value = self
            .value
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "None".to_owned());
        format!("Updated keyword {} to value {}", name.to_uppercase(), value)
    }

    /// Write the keyword's value into a header under its canonical name and,
    /// if asked, under every synonym as well. With `history`, a HISTORY card
    /// is added for each name written.
    pub fn add_to_header(&self, header: &mut Header, with_synonyms: bool, history: bool) -> Result<()> {
        let value = self
            .value
            .clone()
            .ok_or_else(|| Error::Patch(format!("keyword {} has no value to write", self.name)))?;

        let names = if with_synonyms {
            self.names()
        } else {
            vec![self.name.as_str()]
        };

        for name in names {
            match &self.comment {
                Some(c) => header.set_with_comment(name, value.clone(), c.as_str()),
                None => header.set(name, value.clone()),
            }

            if history {
                header.add_history(self.history_comment_for(name));
            }
        }

        Ok(())
    }

    /// Take the keyword's value from a header, looking under every name. All
    /// names present must agree.
    pub fn set_value_from_header(&mut self, header: &Header) -> Result<()> {
        let mut found: Option<&Value> = None;

        for name in self.names() {
            let Some(v) = header.get(name) else {
                continue;
            };

            match found {
                None => found = Some(v),
                Some(prev) if prev == v => {}
                Some(prev) => {
                    return Err(Error::InconsistentSynonyms(format!(
                        "{} has {} and {} has {}",
                        self.name,
                        prev.to_literal(),
                        name,
                        v.to_literal()
                    )))
                }
            }
        }

        match found {
            Some(v) => {
                self.value = Some(v.clone());
                Ok(())
            }
            None => Err(Error::KeywordNotFound(self.names().join("/"))),
        }
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;

        if !self.synonyms.is_empty() {
            write!(f, " (a.k.a. {})", self.synonyms.join(", "))?;
        }

        if let Some(v) = &self.value {
            write!(f, " = {}", v.to_literal())?;
        }

        Ok(())
    }
}

/// The keywords that the header patcher knows how to fill in, with the
/// comments that get written alongside them.
#[derive(Clone, Debug)]
pub struct StandardKeywords {
    pub ra: Keyword,
    pub dec: Keyword,
    pub object: Keyword,
    pub hour_angle: Keyword,
    pub airmass: Keyword,
    pub altitude_obj: Keyword,
    pub azimuth_obj: Keyword,
    pub latitude: Keyword,
    pub longitude: Keyword,
    pub site_altitude: Keyword,
    pub lst: Keyword,
    pub jd: Keyword,
    pub mjd: Keyword,
    pub biassec: Keyword,
    pub trimsec: Keyword,
}

impl StandardKeywords {
    pub fn new() -> Self {
        // These names are all literals known to be valid, so building them
        // can't fail.
        fn kw(name: &str, synonyms: &[&str], comment: &str) -> Keyword {
            Keyword {
                name: name.to_owned(),
                synonyms: synonyms.iter().map(|s| (*s).to_owned()).collect(),
                value: None,
                comment: Some(comment.to_owned()),
            }
        }

        StandardKeywords {
            ra: kw("RA", &["OBJCTRA"], "Approximate RA at EQUINOX"),
            dec: kw("DEC", &["OBJCTDEC"], "Approximate DEC at EQUINOX"),
            object: kw("OBJECT", &[], "Target of the observations"),
            hour_angle: kw("HA", &[], "Hour angle"),
            airmass: kw(
                "AIRMASS",
                &["SECZ"],
                "Airmass (Sec(Z)) at start of observation",
            ),
            altitude_obj: kw("ALT-OBJ", &[], "[degrees] Altitude of object, no refraction"),
            azimuth_obj: kw("AZ-OBJ", &[], "[degrees] Azimuth of object, no refraction"),
            latitude: kw("LATITUDE", &["SITELAT"], "[degrees] Observatory latitude"),
            longitude: kw("LONGITUD", &["SITELONG"], "[degrees east] Observatory longitude"),
            site_altitude: kw("ALTITUDE", &[], "[meters] Observatory altitude"),
            lst: kw("LST", &[], "Local Sidereal Time at start of observation"),
            jd: kw("JD-OBS", &[], "Julian Date at start of observation"),
            mjd: kw("MJD-OBS", &[], "Modified Julian date at start of observation"),
            biassec: kw("BIASSEC", &[], "Useful region of the overscan"),
            trimsec: kw("TRIMSEC", &[], "Region to keep after trimming overscan"),
        }
    }

    /// Keywords whose values are set for every image type.
    pub fn for_all_files(&self) -> [&Keyword; 6] {
        [
            &self.latitude,
            &self.longitude,
            &self.site_altitude,
            &self.lst,
            &self.jd,
            &self.mjd,
        ]
    }

    /// Keywords that only make sense for light frames.
    pub fn for_light_files(&self) -> [&Keyword; 7] {
        [
            &self.ra,
            &self.dec,
            &self.object,
            &self.hour_angle,
            &self.airmass,
            &self.altitude_obj,
            &self.azimuth_obj,
        ]
    }

    pub fn for_overscan(&self) -> [&Keyword; 2] {
        [&self.biassec, &self.trimsec]
    }
}

impl Default for StandardKeywords {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_synonyms() {
        let kw = Keyword::make("ra", ["objctra", "RA", "ObjCtRa", "ra_obj"]).unwrap();
        assert_eq!(kw.name(), "RA");
        assert_eq!(kw.names(), vec!["RA", "OBJCTRA", "RA_OBJ"]);

        let mut kw = kw;
        kw.set_name("objctra").unwrap();
        assert_eq!(kw.names(), vec!["OBJCTRA", "RA_OBJ"]);
    }

    #[test]
    fn validation() {
        assert!(Keyword::new("").is_err());
        assert!(Keyword::new("waytoolongname").is_err());
        assert!(Keyword::new("has space").is_err());
        assert!(Keyword::make("ok", ["b@d"]).is_err());
        assert!(Keyword::new("date-obs").is_ok());
        assert!(matches!(
            Keyword::new("x=y"),
            Err(Error::InvalidKeyword(_))
        ));
    }

    #[test]
    fn header_roundtrip() {
        let mut hdr = Header::new();
        let kw = Keyword::make("airmass", ["secz"])
            .unwrap()
            .with_comment("Airmass")
            .with_value(1.25);

        kw.add_to_header(&mut hdr, true, true).unwrap();
        assert_eq!(hdr.get("SECZ"), Some(&Value::Float(1.25)));
        assert_eq!(
            hdr.history(),
            vec![
                "Updated keyword AIRMASS to value 1.25",
                "Updated keyword SECZ to value 1.25"
            ]
        );

        let mut other = Keyword::make("airmass", ["secz"]).unwrap();
        other.set_value_from_header(&hdr).unwrap();
        assert_eq!(other.value(), Some(&Value::Float(1.25)));

        hdr.set("SECZ", 2.0);
        assert!(matches!(
            other.set_value_from_header(&hdr),
            Err(Error::InconsistentSynonyms(_))
        ));

        let mut absent = Keyword::new("object").unwrap();
        assert!(matches!(
            absent.set_value_from_header(&hdr),
            Err(Error::KeywordNotFound(_))
        ));
    }

    #[test]
    fn synonym_only_lookup() {
        let mut hdr = Header::new();
        hdr.set("OBJCTRA", "12 34 56");
        let mut ra = StandardKeywords::new().ra;
        ra.set_value_from_header(&hdr).unwrap();
        assert_eq!(ra.value(), Some(&Value::from("12 34 56")));
    }
}
