//! Field projections.

use std::collections::BTreeMap;

use livedata_core::value::ID_FIELD;
use livedata_core::{Document, Error, Result};
use serde_json::Value;

use crate::path::split_path;

#[derive(Debug, Clone, Default)]
struct FieldTree {
    children: BTreeMap<String, FieldTree>,
}

impl FieldTree {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn insert(&mut self, parts: &[String], full: &str) -> Result<()> {
        let Some((first, rest)) = parts.split_first() else {
            return Ok(());
        };
        let exists = self.children.contains_key(first);
        let child = self.children.entry(first.clone()).or_default();
        if exists && (child.is_leaf() || rest.is_empty()) {
            return Err(Error::invalid_projection(format!(
                "path collision at {}",
                full
            )));
        }
        child.insert(rest, full)
    }
}

/// A compiled field projection.
///
/// Either includes or excludes the listed fields; `_id` is kept unless it
/// is excluded explicitly.
#[derive(Debug, Clone)]
pub struct Projection {
    including: bool,
    tree: FieldTree,
    include_id: bool,
}

impl Projection {
    /// Compiles a projection specifier such as `{title: 1, "meta.tags": 1}`.
    pub fn new(spec: &Value) -> Result<Self> {
        let map = spec
            .as_object()
            .ok_or_else(|| Error::invalid_projection("projection must be an object"))?;

        let mut including = None;
        let mut include_id = true;
        let mut tree = FieldTree::default();
        for (path, flag) in map {
            let keep = match flag {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
                other => {
                    return Err(Error::invalid_projection(format!(
                        "unsupported projection value for {}: {}",
                        path, other
                    )))
                }
            };
            if path == ID_FIELD {
                include_id = keep;
                continue;
            }
            match including {
                Some(mode) if mode != keep => {
                    return Err(Error::invalid_projection(
                        "cannot mix inclusion and exclusion",
                    ))
                }
                _ => including = Some(keep),
            }
            tree.insert(&split_path(path), path)?;
        }

        Ok(Self {
            // `{_id: 0}` alone excludes only the id.
            including: including.unwrap_or(false),
            tree,
            include_id,
        })
    }

    /// Applies the projection, returning a new document.
    pub fn apply(&self, doc: &Document) -> Document {
        let mut out = if self.including {
            let mut out = Document::new();
            include(&self.tree, doc, &mut out);
            if let Some(id) = doc.get(ID_FIELD) {
                out.insert(ID_FIELD.to_string(), id.clone());
            }
            out
        } else {
            let mut out = doc.clone();
            exclude(&self.tree, &mut out);
            out
        };
        if !self.include_id {
            out.remove(ID_FIELD);
        }
        out
    }
}

fn include(tree: &FieldTree, doc: &Document, out: &mut Document) {
    for (key, child) in &tree.children {
        let Some(value) = doc.get(key) else { continue };
        if child.is_leaf() {
            out.insert(key.clone(), value.clone());
            continue;
        }
        match value {
            Value::Object(inner) => {
                let mut sub = Document::new();
                include(child, inner, &mut sub);
                out.insert(key.clone(), Value::Object(sub));
            }
            Value::Array(items) => {
                let projected = items
                    .iter()
                    .filter_map(|item| item.as_object())
                    .map(|inner| {
                        let mut sub = Document::new();
                        include(child, inner, &mut sub);
                        Value::Object(sub)
                    })
                    .collect();
                out.insert(key.clone(), Value::Array(projected));
            }
            _ => {}
        }
    }
}

fn exclude(tree: &FieldTree, doc: &mut Document) {
    for (key, child) in &tree.children {
        if child.is_leaf() {
            doc.remove(key);
            continue;
        }
        match doc.get_mut(key) {
            Some(Value::Object(inner)) => exclude(child, inner),
            Some(Value::Array(items)) => {
                for item in items.iter_mut() {
                    if let Value::Object(inner) = item {
                        exclude(child, inner);
                    }
                }
            }
            _ => {}
        }
    }
}
