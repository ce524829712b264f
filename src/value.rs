//! Typed header values.

use anyhow::Result;
use std::fmt;

use crate::fitsfile;

/// The value of a keyed header card.
///
/// Integers and floats are kept apart so that they can be written back the way
/// we found them, but they share the [`ValueKind::Numeric`] kind and compare
/// equal across the two representations.
#[derive(Clone, Debug)]
pub enum Value {
    Text(String),
    Integer(i64),
    Float(f64),
    Logical(bool),
}

/// The coarse type of a [`Value`]. Two values of different kinds are never
/// interchangeable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Text,
    Numeric,
    Logical,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Text => f.write_str("text"),
            ValueKind::Numeric => f.write_str("numeric"),
            ValueKind::Logical => f.write_str("logical"),
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Text(_) => ValueKind::Text,
            Value::Integer(_) | Value::Float(_) => ValueKind::Numeric,
            Value::Logical(_) => ValueKind::Logical,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(x) if x.fract() == 0. => Some(*x as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Logical(b) => Some(*b),
            _ => None,
        }
    }

    /// Loose comparison used when matching user-supplied values: text is
    /// compared case-insensitively, numbers by value.
    pub fn matches(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a.to_lowercase() == b.to_lowercase(),
            _ => self == other,
        }
    }

    /// Format in FITS value syntax: `'TEXT'` with embedded quotes doubled,
    /// `T`/`F`, or a number. Floats always carry a decimal point or exponent
    /// so that they read back as floats.
    pub fn to_literal(&self) -> String {
        match self {
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Integer(i) => i.to_string(),
            Value::Float(x) => format_float(*x),
            Value::Logical(true) => "T".to_owned(),
            Value::Logical(false) => "F".to_owned(),
        }
    }

    /// Parse text in FITS value syntax, using CFITSIO's own rules. An empty
    /// (all-blank) string is the FITS "undefined" value and comes back as
    /// `None`.
    pub fn parse_literal(text: &str) -> Result<Option<Value>> {
        fitsfile::parse_value_string(text)
    }
}

fn format_float(x: f64) -> String {
    // The Debug impl gives the shortest text that round-trips, switching to
    // exponential notation for very large and very small magnitudes.
    let s = format!("{:?}", x).replace('e', "E");

    if s.contains(['.', 'E', 'N', 'n']) {
        s
    } else {
        format!("{}.0", s)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Logical(a), Value::Logical(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Logical(true) => f.write_str("True"),
            Value::Logical(false) => f.write_str("False"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Logical(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals() {
        assert_eq!(
            Value::parse_literal("'LIGHT   '").unwrap(),
            Some(Value::from("LIGHT"))
        );
        assert_eq!(
            Value::parse_literal("'O''Brien'").unwrap(),
            Some(Value::from("O'Brien"))
        );
        assert_eq!(Value::parse_literal("''").unwrap(), Some(Value::from("")));
        assert_eq!(Value::parse_literal("   ").unwrap(), None);
        assert_eq!(Value::parse_literal("T").unwrap(), Some(Value::from(true)));
        assert_eq!(Value::parse_literal("-12").unwrap(), Some(Value::from(-12i64)));
        assert_eq!(
            Value::parse_literal("1.5D2").unwrap(),
            Some(Value::from(150.0))
        );
        assert!(Value::parse_literal("'open").is_err());
    }

    #[test]
    fn floats_stay_floats() {
        let lit = Value::Float(30.).to_literal();
        assert_eq!(lit, "30.0");

        match Value::parse_literal(&lit).unwrap() {
            Some(Value::Float(x)) => assert_eq!(x, 30.),
            other => panic!("expected a float, got {:?}", other),
        }
    }

    #[test]
    fn numeric_kinds_compare() {
        assert_eq!(Value::Integer(30), Value::Float(30.));
        assert_eq!(Value::Integer(30).kind(), Value::Float(1.).kind());
        assert_ne!(Value::from("30"), Value::Integer(30));
        assert!(Value::from("Light").matches(&Value::from("LIGHT")));
        assert!(!Value::from("Light").matches(&Value::from("DARK")));
    }
}
