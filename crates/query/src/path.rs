//! Dotted path lookup with array traversal.

use livedata_core::Document;
use serde_json::Value;

/// Splits a dotted path into its parts.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(String::from).collect()
}

/// Returns true if `part` addresses an array index.
#[inline]
pub fn is_numeric_key(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

/// Looks up a dotted path, returning one branch per reachable location.
///
/// Arrays met along the way fan out into their object elements unless the
/// next part is a numeric index. `None` marks a missing value.
pub fn lookup<'a>(doc: &'a Document, parts: &[String]) -> Vec<Option<&'a Value>> {
    let mut out = Vec::new();
    match parts.split_first() {
        Some((first, rest)) => lookup_value(doc.get(first.as_str()), rest, &mut out),
        None => out.push(None),
    }
    out
}

fn lookup_value<'a>(value: Option<&'a Value>, parts: &[String], out: &mut Vec<Option<&'a Value>>) {
    let Some((first, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };

    match value {
        Some(Value::Object(map)) => lookup_value(map.get(first.as_str()), rest, out),
        Some(Value::Array(items)) if is_numeric_key(first) => {
            let index = first.parse::<usize>().ok();
            lookup_value(index.and_then(|i| items.get(i)), rest, out)
        }
        Some(Value::Array(items)) => {
            let before = out.len();
            for item in items.iter().filter(|item| item.is_object()) {
                lookup_value(Some(item), parts, out);
            }
            if out.len() == before {
                out.push(None);
            }
        }
        _ => out.push(None),
    }
}

/// Adds the elements of array branches next to the arrays themselves.
///
/// `{tags: "a"}` matches `{tags: ["a", "b"]}` because of this expansion.
pub fn expand_arrays<'a>(branches: &[Option<&'a Value>]) -> Vec<Option<&'a Value>> {
    let mut expanded = Vec::with_capacity(branches.len());
    for branch in branches {
        if let Some(Value::Array(items)) = branch {
            expanded.extend(items.iter().map(Some));
        }
        expanded.push(*branch);
    }
    expanded
}
