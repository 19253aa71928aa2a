//! The generic tagged document value.
//!
//! [`DocValue`] is the boundary representation for documents: what the REST
//! layer hands in, what the shaper turns into a shaped binary payload, and
//! what query results materialize back into. Object attributes keep their
//! insertion order here; canonical (weight-based) ordering is the shaper's
//! business, not the value's.

use std::fmt;

use serde::ser::{SerializeMap, SerializeSeq};

/// A JSON-like document value.
///
/// Numbers are IEEE 754 doubles, matching the shaped storage format. Objects
/// are attribute lists in insertion order; duplicate attribute names are not
/// representable by construction at the API boundary (conversion from JSON
/// keeps the last occurrence).
#[derive(Debug, Clone, PartialEq)]
pub enum DocValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<DocValue>),
    Object(Vec<(String, DocValue)>),
}

impl DocValue {
    /// AQL truthiness: `null`, `false`, `0` and `""` are false; every list
    /// and object (including empty ones) is true.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::List(_) | Self::Object(_) => true,
        }
    }

    /// Look up a top-level attribute by name (objects only).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DocValue> {
        match self {
            Self::Object(attrs) => attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Resolve a dotted path such as `a.b.c` against nested objects.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&DocValue> {
        let mut current = self;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Index into a list.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<&DocValue> {
        match self {
            Self::List(items) => items.get(index),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Build an object value from `(name, value)` pairs.
    #[must_use]
    pub fn object<I, K>(attrs: I) -> Self
    where
        I: IntoIterator<Item = (K, DocValue)>,
        K: Into<String>,
    {
        Self::Object(attrs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<serde_json::Value> for DocValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&DocValue> for serde_json::Value {
    fn from(v: &DocValue) -> Self {
        match v {
            DocValue::Null => Self::Null,
            DocValue::Bool(b) => Self::Bool(*b),
            // Integral doubles render as JSON integers so values that went
            // through the number representation read back exact.
            DocValue::Number(n) if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 => {
                Self::Number(serde_json::Number::from(*n as i64))
            }
            DocValue::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(Self::Null, Self::Number),
            DocValue::String(s) => Self::String(s.clone()),
            DocValue::List(items) => Self::Array(items.iter().map(Into::into).collect()),
            DocValue::Object(attrs) => Self::Object(
                attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl serde::Serialize for DocValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::String(s) => serializer.serialize_str(s),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(attrs) => {
                let mut map = serializer.serialize_map(Some(attrs.len()))?;
                for (k, v) in attrs {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> serde::Deserialize<'de> for DocValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(raw.into())
    }
}

impl fmt::Display for DocValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json: serde_json::Value = self.into();
        write!(f, "{json}")
    }
}
