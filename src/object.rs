//! The `Object` data model: an id, a value (geometry or opaque string), an
//! expiration, and an ordered field list.

use crate::geometry::Geometry;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A field value as carried by `SET ... FIELD name value` / `FSET`. Mirrors
/// the scalar subset of JSON the wire protocol accepts for fields; kept as a
/// concrete small enum rather than `serde_json::Value` so hot-path WHERE
/// evaluation doesn't pay JSON's tagging overhead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl FieldValue {
    /// Numeric coercion used by WHERE range comparisons; unknown/non-numeric
    /// fields compare as 0, per spec §4.6.
    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Num(n) => *n,
            FieldValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            FieldValue::Str(s) => s.parse().unwrap_or(0.0),
            FieldValue::Null => 0.0,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Num(n) => write!(f, "{n}"),
            FieldValue::Str(s) => write!(f, "{s}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Null => write!(f, "null"),
        }
    }
}

/// Insertion-ordered field list. Field names are reserved for `z`, `lat`,
/// `lon` and must be lowercase (enforced by the command parser, not here).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fields(pub Vec<(String, FieldValue)>);

impl Fields {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Apply a single `field value` assignment, replacing an existing entry
    /// in place (preserving position) or appending a new one.
    pub fn set(&mut self, name: &str, value: FieldValue) {
        if let Some(entry) = self.0.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.0.push((name.to_string(), value));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Either spatial geometry or an opaque string value (`STRING s`). Strings
/// are not spatially indexed; `SEARCH` orders them lexically instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Geom(Geometry),
    Str(String),
}

impl Value {
    pub fn as_geometry(&self) -> Option<&Geometry> {
        match self {
            Value::Geom(g) => Some(g),
            Value::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Geom(_) => None,
        }
    }
}

/// An immutable record in a collection. Mutation always produces a new
/// `Object` that replaces the prior one by id (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub id: String,
    pub value: Value,
    /// Nanosecond timestamp, 0 means "no expiration".
    pub expires_at: i64,
    pub fields: Fields,
}

impl Object {
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Object {
            id: id.into(),
            value,
            expires_at: 0,
            fields: Fields::default(),
        }
    }

    pub fn has_expiration(&self) -> bool {
        self.expires_at != 0
    }

    pub fn is_expired(&self, now_nanos: i64) -> bool {
        self.has_expiration() && self.expires_at <= now_nanos
    }
}
