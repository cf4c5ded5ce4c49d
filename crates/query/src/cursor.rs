//! Live query descriptions.

use livedata_core::{Document, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::matcher::Matcher;
use crate::projection::Projection;
use crate::sorter::Sorter;

/// Options of a query beyond its selector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Forces the polling strategy on the server.
    #[serde(default, rename = "disableOplog")]
    pub disable_oplog: bool,
}

/// Immutable description of a live query.
///
/// Two descriptions with structurally equal contents describe the same live
/// view; [`CursorDescription::key`] is the canonical form used to share one
/// observer between them.
///
/// # Example
///
/// ```ignore
/// let cursor = CursorDescription::new("docs", json!({"status": "open"}))
///     .with_sort(json!({"createdAt": -1}))
///     .with_limit(20);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorDescription {
    pub collection: String,
    pub selector: Value,
    #[serde(default)]
    pub options: CursorOptions,
}

impl CursorDescription {
    /// Creates a description with default options.
    pub fn new(collection: impl Into<String>, selector: Value) -> Self {
        Self {
            collection: collection.into(),
            selector,
            options: CursorOptions::default(),
        }
    }

    pub fn with_sort(mut self, sort: Value) -> Self {
        self.options.sort = Some(sort);
        self
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.options.fields = Some(fields);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.options.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn with_disable_oplog(mut self, disable: bool) -> Self {
        self.options.disable_oplog = disable;
        self
    }

    /// Returns true if clients need positional information for this query.
    #[inline]
    pub fn is_ordered(&self) -> bool {
        self.options.sort.is_some() && (self.options.limit.is_some() || self.options.skip.is_some())
    }

    /// Canonical text form. Object keys are sorted except inside the sort
    /// specifier, where key order is significant.
    pub fn key(&self) -> String {
        let mut canonical = Map::new();
        canonical.insert("collection".into(), Value::String(self.collection.clone()));
        canonical.insert("selector".into(), canonicalize(&self.selector));
        if let Some(sort) = &self.options.sort {
            canonical.insert("sort".into(), sort.clone());
        }
        if let Some(fields) = &self.options.fields {
            canonical.insert("fields".into(), canonicalize(fields));
        }
        if let Some(skip) = self.options.skip {
            canonical.insert("skip".into(), Value::from(skip));
        }
        if let Some(limit) = self.options.limit {
            canonical.insert("limit".into(), Value::from(limit));
        }
        if self.options.disable_oplog {
            canonical.insert("disableOplog".into(), Value::Bool(true));
        }
        Value::Object(canonical).to_string()
    }

    /// Compiles selector, sort and projection.
    pub fn compile(&self) -> Result<CompiledCursor> {
        Ok(CompiledCursor {
            matcher: Matcher::new(&self.selector)?,
            sorter: self.options.sort.as_ref().map(Sorter::new).transpose()?,
            projection: self.options.fields.as_ref().map(Projection::new).transpose()?,
            skip: self.options.skip.unwrap_or(0),
            limit: self.options.limit,
        })
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// A compiled query, ready to run against any set of documents.
#[derive(Debug, Clone)]
pub struct CompiledCursor {
    pub matcher: Matcher,
    pub sorter: Option<Sorter>,
    pub projection: Option<Projection>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl CompiledCursor {
    /// Filters, sorts, windows and projects `docs`.
    pub fn execute<'a>(&self, docs: impl IntoIterator<Item = &'a Document>) -> Vec<Document> {
        self.select(docs)
            .into_iter()
            .map(|doc| self.project(doc))
            .collect()
    }

    /// Filters, sorts and windows `docs` without projecting them.
    pub fn select<'a>(&self, docs: impl IntoIterator<Item = &'a Document>) -> Vec<&'a Document> {
        let mut matched: Vec<&Document> = docs
            .into_iter()
            .filter(|doc| self.matcher.document_matches(doc))
            .collect();
        if let Some(sorter) = &self.sorter {
            matched.sort_by(|a, b| sorter.compare(a, b));
        }
        let limit = self.limit.unwrap_or(usize::MAX);
        matched.into_iter().skip(self.skip).take(limit).collect()
    }

    /// Applies the projection, if any, to one document.
    pub fn project(&self, doc: &Document) -> Document {
        match &self.projection {
            Some(projection) => projection.apply(doc),
            None => doc.clone(),
        }
    }

    /// Returns true if the query has a skip or limit window.
    #[inline]
    pub fn is_windowed(&self) -> bool {
        self.skip > 0 || self.limit.is_some()
    }
}
