//! Sort specifier compilation.

use core::cmp::Ordering;

use livedata_core::value::{compare_values, ID_FIELD};
use livedata_core::{Document, Error, Result};
use serde_json::Value;

use crate::path::{lookup, split_path};

#[derive(Debug, Clone)]
struct SortKey {
    path: Vec<String>,
    ascending: bool,
}

/// A compiled sort specifier.
///
/// Accepts `{a: 1, b: -1}`, `[["a", "asc"], ["b", "desc"]]` or `["a", "b"]`.
/// Array fields sort by their smallest element ascending and their largest
/// element descending; missing fields sort as null. Documents that tie on
/// every key are ordered by `_id` so every replica produces the same order.
#[derive(Debug, Clone)]
pub struct Sorter {
    keys: Vec<SortKey>,
}

impl Sorter {
    /// Compiles a sort specifier.
    pub fn new(spec: &Value) -> Result<Self> {
        let mut keys = Vec::new();
        match spec {
            Value::Object(map) => {
                for (path, direction) in map {
                    keys.push(SortKey {
                        path: split_path(path),
                        ascending: parse_direction(direction)?,
                    });
                }
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::String(path) => keys.push(SortKey {
                            path: split_path(path),
                            ascending: true,
                        }),
                        Value::Array(pair) if pair.len() == 2 => {
                            let path = pair[0]
                                .as_str()
                                .ok_or_else(|| Error::invalid_sort("sort key must be a string"))?;
                            keys.push(SortKey {
                                path: split_path(path),
                                ascending: parse_direction(&pair[1])?,
                            });
                        }
                        other => {
                            return Err(Error::invalid_sort(format!(
                                "bad sort entry: {}",
                                other
                            )))
                        }
                    }
                }
            }
            other => {
                return Err(Error::invalid_sort(format!(
                    "sort specifier must be an object or an array, got {}",
                    other
                )))
            }
        }
        Ok(Self { keys })
    }

    /// Returns true if the specifier has no keys.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Compares two documents.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for key in &self.keys {
            let left = sort_value(a, key);
            let right = sort_value(b, key);
            let ord = compare_values(&left, &right);
            let ord = if key.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        match (a.get(ID_FIELD), b.get(ID_FIELD)) {
            (Some(x), Some(y)) => compare_values(x, y),
            _ => Ordering::Equal,
        }
    }
}

fn parse_direction(direction: &Value) -> Result<bool> {
    match direction {
        Value::Number(n) if n.as_f64() == Some(1.0) => Ok(true),
        Value::Number(n) if n.as_f64() == Some(-1.0) => Ok(false),
        Value::String(s) if s == "asc" || s == "ascending" => Ok(true),
        Value::String(s) if s == "desc" || s == "descending" => Ok(false),
        other => Err(Error::invalid_sort(format!(
            "bad sort direction: {}",
            other
        ))),
    }
}

fn sort_value(doc: &Document, key: &SortKey) -> Value {
    let mut candidates: Vec<&Value> = Vec::new();
    for branch in lookup(doc, &key.path).into_iter().flatten() {
        match branch {
            Value::Array(items) if !items.is_empty() => candidates.extend(items.iter()),
            Value::Array(_) => {}
            other => candidates.push(other),
        }
    }

    let picked = if key.ascending {
        candidates.into_iter().min_by(|x, y| compare_values(x, y))
    } else {
        candidates.into_iter().max_by(|x, y| compare_values(x, y))
    };
    picked.cloned().unwrap_or(Value::Null)
}
