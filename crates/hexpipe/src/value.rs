//! Raw column values and normalized property values.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// A column value exactly as decoded from the source, before any
/// interpretation. Unsigned integers and byte strings are kept distinct
/// because the cell resolver accepts both.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl RawValue {
    /// Converts to the property model. Byte strings are decoded lossily as
    /// UTF-8; unsigned values beyond `i64::MAX` become floats.
    pub fn to_property(&self) -> PropertyValue {
        match self {
            RawValue::Null => PropertyValue::Null,
            RawValue::Bool(b) => PropertyValue::Bool(*b),
            RawValue::Int(i) => PropertyValue::Int(*i),
            RawValue::UInt(u) => match i64::try_from(*u) {
                Ok(i) => PropertyValue::Int(i),
                Err(_) => PropertyValue::Float(*u as f64),
            },
            RawValue::Float(f) => PropertyValue::Float(*f),
            RawValue::Str(s) => PropertyValue::String(s.clone()),
            RawValue::Bytes(b) => PropertyValue::String(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Str(s.to_owned())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Str(s)
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        RawValue::Int(v)
    }
}

impl From<u64> for RawValue {
    fn from(v: u64) -> Self {
        RawValue::UInt(v)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Float(v)
    }
}

impl From<bool> for RawValue {
    fn from(v: bool) -> Self {
        RawValue::Bool(v)
    }
}

/// A feature attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Null => "null",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::String(_) => "string",
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PropertyValue::Null => serializer.serialize_unit(),
            PropertyValue::Bool(b) => serializer.serialize_bool(*b),
            PropertyValue::Int(i) => serializer.serialize_i64(*i),
            // serde_json writes non-finite floats as null.
            PropertyValue::Float(f) => serializer.serialize_f64(*f),
            PropertyValue::String(s) => serializer.serialize_str(s),
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Null => f.write_str("null"),
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// Attribute map; ordered so serialization and diagnostics are stable.
pub type PropertyBag = BTreeMap<String, PropertyValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_overflow_becomes_float() {
        assert_eq!(RawValue::UInt(7).to_property(), PropertyValue::Int(7));
        assert!(matches!(
            RawValue::UInt(u64::MAX).to_property(),
            PropertyValue::Float(_)
        ));
    }

    #[test]
    fn bag_serializes_in_key_order() {
        let mut bag = PropertyBag::new();
        bag.insert("zeta".into(), PropertyValue::Int(1));
        bag.insert("alpha".into(), PropertyValue::String("x".into()));
        bag.insert("mid".into(), PropertyValue::Null);
        let json = serde_json::to_string(&bag).unwrap();
        assert_eq!(json, r#"{"alpha":"x","mid":null,"zeta":1}"#);
    }

    #[test]
    fn non_finite_float_serializes_as_null() {
        let mut bag = PropertyBag::new();
        bag.insert("bad".into(), PropertyValue::Float(f64::NAN));
        assert_eq!(serde_json::to_string(&bag).unwrap(), r#"{"bad":null}"#);
    }
}
