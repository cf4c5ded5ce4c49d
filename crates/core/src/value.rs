//! Document values and their ordering.
//!
//! Documents are JSON objects. Every comparison in the workspace (sorting,
//! range operators, result-set diffs) goes through [`compare_values`] and
//! [`values_equal`] so the client cache and the server agree on order and
//! membership.

use core::cmp::Ordering;
use core::fmt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;

use crate::error::{Error, Result};

/// A document: a JSON object carrying an `_id` field.
pub type Document = Map<String, Value>;

/// Map keyed by document id.
pub type IdMap<V> = hashbrown::HashMap<DocumentId, V>;

/// Name of the identifier field.
pub const ID_FIELD: &str = "_id";

/// Unique identifier of a document within its collection.
///
/// Only string ids are supported. Documents whose `_id` is a number, an
/// object or an ObjectID-style `{"$type": "oid", ...}` value are rejected by
/// [`DocumentId::of`] with a malformed-input error; stores holding such ids
/// have to map them to strings before handing documents over.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Creates an id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads the `_id` field of a document.
    pub fn of(doc: &Document) -> Result<Self> {
        match doc.get(ID_FIELD) {
            Some(Value::String(s)) => Ok(Self(s.clone())),
            Some(other) => Err(Error::malformed(format!(
                "document _id must be a string, got {}",
                other
            ))),
            None => Err(Error::malformed("document has no _id")),
        }
    }

    /// Converts the id into its JSON representation.
    pub fn to_value(&self) -> Value {
        Value::String(self.0.clone())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for DocumentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Converts a JSON value into a document, rejecting non-objects.
pub fn to_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::malformed(format!(
            "expected a document, got {}",
            other
        ))),
    }
}

/// Returns a copy of `doc` without its `_id` field.
pub fn fields_of(doc: &Document) -> Document {
    let mut fields = doc.clone();
    fields.remove(ID_FIELD);
    fields
}

/// Returns the rank of a value's type in the cross-type ordering.
///
/// null < numbers < strings < objects < arrays < booleans
#[inline]
pub fn type_order(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 8,
    }
}

/// Total order over values.
///
/// Values of different types order by [`type_order`]. Arrays compare
/// element-wise, then by length. Objects compare as the flattened sequence
/// of their keys and values.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ta, tb) = (type_order(a), type_order(b));
    if ta != tb {
        return ta.cmp(&tb);
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => compare_sequences(x.iter(), y.iter()),
        (Value::Object(x), Value::Object(y)) => {
            let fx = flatten_object(x);
            let fy = flatten_object(y);
            compare_sequences(fx.iter(), fy.iter())
        }
        _ => Ordering::Equal,
    }
}

fn compare_sequences<'a>(
    mut a: impl Iterator<Item = &'a Value>,
    mut b: impl Iterator<Item = &'a Value>,
) -> Ordering {
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match compare_values(x, y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

fn flatten_object(map: &Map<String, Value>) -> Vec<Value> {
    let mut flat = Vec::with_capacity(map.len() * 2);
    for (key, value) in map {
        flat.push(Value::String(key.clone()));
        flat.push(value.clone());
    }
    flat
}

/// Structural equality where `1` and `1.0` are the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => documents_equal(x, y),
        _ => a == b,
    }
}

/// Structural equality of two documents, ignoring key order.
pub fn documents_equal(a: &Document, b: &Document) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(key, value)| b.get(key).map_or(false, |other| values_equal(value, other)))
}
