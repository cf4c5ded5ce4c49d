//! Materialized result sets of live queries.

use livedata_core::diff::{apply_changes, diff_query_ordered_changes, diff_query_unordered_changes};
use livedata_core::value::{fields_of, ID_FIELD};
use livedata_core::{Document, DocumentId, Error, IdMap, ObserveEvent, Result};

/// Builds a document from its id and remaining fields.
pub(crate) fn with_id(id: &DocumentId, fields: &Document) -> Document {
    let mut doc = Document::with_capacity(fields.len() + 1);
    doc.insert(ID_FIELD.to_string(), id.to_value());
    for (key, value) in fields {
        if key != ID_FIELD {
            doc.insert(key.clone(), value.clone());
        }
    }
    doc
}

/// The current result set of a live query, documents stored with `_id`.
#[derive(Debug, Clone)]
pub(crate) enum ResultSet {
    Unordered(IdMap<Document>),
    Ordered(Vec<Document>),
}

impl ResultSet {
    pub(crate) fn new(ordered: bool) -> Self {
        if ordered {
            ResultSet::Ordered(Vec::new())
        } else {
            ResultSet::Unordered(IdMap::new())
        }
    }

    /// Builds a result set from query output.
    pub(crate) fn from_docs(ordered: bool, docs: Vec<Document>) -> Result<Self> {
        if ordered {
            for doc in &docs {
                DocumentId::of(doc)?;
            }
            return Ok(ResultSet::Ordered(docs));
        }
        let mut map = IdMap::with_capacity(docs.len());
        for doc in docs {
            map.insert(DocumentId::of(&doc)?, doc);
        }
        Ok(ResultSet::Unordered(map))
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            ResultSet::Unordered(map) => map.len(),
            ResultSet::Ordered(docs) => docs.len(),
        }
    }

    /// Events that build this result set from nothing.
    pub(crate) fn initial_events(&self) -> Vec<ObserveEvent> {
        match self {
            ResultSet::Unordered(map) => map
                .iter()
                .map(|(id, doc)| ObserveEvent::Added {
                    id: id.clone(),
                    fields: fields_of(doc),
                })
                .collect(),
            ResultSet::Ordered(docs) => docs
                .iter()
                .filter_map(|doc| {
                    DocumentId::of(doc).ok().map(|id| ObserveEvent::AddedBefore {
                        id,
                        fields: fields_of(doc),
                        before: None,
                    })
                })
                .collect(),
        }
    }

    /// Events that turn `self` into `next`.
    pub(crate) fn diff(&self, next: &ResultSet) -> Result<Vec<ObserveEvent>> {
        match (self, next) {
            (ResultSet::Unordered(old), ResultSet::Unordered(new)) => {
                Ok(diff_query_unordered_changes(old, new))
            }
            (ResultSet::Ordered(old), ResultSet::Ordered(new)) => {
                diff_query_ordered_changes(old, new)
            }
            _ => Err(Error::invariant("diff between ordered and unordered results")),
        }
    }

    /// Applies one event.
    pub(crate) fn apply(&mut self, event: &ObserveEvent) -> Result<()> {
        match self {
            ResultSet::Unordered(map) => match event {
                ObserveEvent::Added { id, fields } | ObserveEvent::AddedBefore { id, fields, .. } => {
                    if map.insert(id.clone(), with_id(id, fields)).is_some() {
                        return Err(Error::invariant(format!("{} added twice", id)));
                    }
                }
                ObserveEvent::Changed { id, fields } => {
                    let doc = map
                        .get_mut(id)
                        .ok_or_else(|| Error::invariant(format!("changed unknown {}", id)))?;
                    apply_changes(doc, fields);
                }
                ObserveEvent::MovedBefore { .. } => {}
                ObserveEvent::Removed { id } => {
                    map.remove(id)
                        .ok_or_else(|| Error::invariant(format!("removed unknown {}", id)))?;
                }
            },
            ResultSet::Ordered(docs) => match event {
                ObserveEvent::Added { id, fields } => docs.push(with_id(id, fields)),
                ObserveEvent::AddedBefore { id, fields, before } => {
                    let at = insert_position(docs, before.as_ref())?;
                    docs.insert(at, with_id(id, fields));
                }
                ObserveEvent::Changed { id, fields } => {
                    let at = position(docs, id)?;
                    apply_changes(&mut docs[at], fields);
                }
                ObserveEvent::MovedBefore { id, before } => {
                    let doc = docs.remove(position(docs, id)?);
                    let at = insert_position(docs, before.as_ref())?;
                    docs.insert(at, doc);
                }
                ObserveEvent::Removed { id } => {
                    let at = position(docs, id)?;
                    docs.remove(at);
                }
            },
        }
        Ok(())
    }
}

fn position(docs: &[Document], id: &DocumentId) -> Result<usize> {
    docs.iter()
        .position(|doc| doc.get(ID_FIELD).and_then(|v| v.as_str()) == Some(id.as_str()))
        .ok_or_else(|| Error::invariant(format!("unknown document {}", id)))
}

fn insert_position(docs: &[Document], before: Option<&DocumentId>) -> Result<usize> {
    match before {
        Some(before) => position(docs, before),
        None => Ok(docs.len()),
    }
}
