//! Per-session merge of documents published by several subscriptions.
//!
//! Two subscriptions may publish the same document with different fields.
//! The client holds one copy: for every field the value of the first
//! subscription that published it wins, and the other values wait behind
//! it. Withdrawing a subscription lets the next value through.

use std::collections::{BTreeMap, BTreeSet};

use livedata_core::protocol::ServerMessage;
use livedata_core::value::{values_equal, ID_FIELD};
use livedata_core::{ChangedFields, Document, DocumentId, Error, IdMap, Result};
use serde_json::Value;

#[derive(Debug, Clone)]
struct FieldSource {
    subscription: String,
    value: Value,
}

/// One document as the session's client sees it.
#[derive(Debug, Default)]
struct SessionDocumentView {
    existing_in: BTreeSet<String>,
    /// Per field, the contributing subscriptions in precedence order.
    data_by_key: BTreeMap<String, Vec<FieldSource>>,
}

impl SessionDocumentView {
    fn fields(&self) -> Document {
        self.data_by_key
            .iter()
            .filter_map(|(key, sources)| {
                sources.first().map(|s| (key.clone(), s.value.clone()))
            })
            .collect()
    }

    fn clear_field(&mut self, subscription: &str, key: &str, changes: &mut ChangedFields) {
        let Some(sources) = self.data_by_key.get_mut(key) else {
            return;
        };
        let Some(at) = sources.iter().position(|s| s.subscription == subscription) else {
            return;
        };
        let removed = sources.remove(at);
        match sources.first() {
            None => {
                self.data_by_key.remove(key);
                changes.insert(key.to_string(), None);
            }
            Some(next) if at == 0 && !values_equal(&removed.value, &next.value) => {
                changes.insert(key.to_string(), Some(next.value.clone()));
            }
            Some(_) => {}
        }
    }

    fn change_field(
        &mut self,
        subscription: &str,
        key: &str,
        value: Value,
        changes: &mut ChangedFields,
        is_add: bool,
    ) {
        if key == ID_FIELD {
            return;
        }
        let Some(sources) = self.data_by_key.get_mut(key) else {
            changes.insert(key.to_string(), Some(value.clone()));
            self.data_by_key.insert(
                key.to_string(),
                vec![FieldSource {
                    subscription: subscription.to_string(),
                    value,
                }],
            );
            return;
        };

        let existing = if is_add {
            None
        } else {
            sources.iter().position(|s| s.subscription == subscription)
        };
        match existing {
            Some(at) => {
                if at == 0 && !values_equal(&sources[0].value, &value) {
                    changes.insert(key.to_string(), Some(value.clone()));
                }
                sources[at].value = value;
            }
            None => sources.push(FieldSource {
                subscription: subscription.to_string(),
                value,
            }),
        }
    }
}

/// The documents of one collection as the session's client sees them.
#[derive(Debug)]
pub(crate) struct SessionCollectionView {
    name: String,
    documents: IdMap<SessionDocumentView>,
}

impl SessionCollectionView {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: IdMap::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Current fields of a document, if the client has it.
    pub(crate) fn get(&self, id: &DocumentId) -> Option<Document> {
        self.documents.get(id).map(SessionDocumentView::fields)
    }

    /// `subscription` publishes a document. `before` carries the position
    /// for ordered publications.
    pub(crate) fn added(
        &mut self,
        subscription: &str,
        id: DocumentId,
        fields: Document,
        before: Option<Option<DocumentId>>,
    ) -> Option<ServerMessage> {
        let mut changes = ChangedFields::new();
        let is_new = !self.documents.contains_key(&id);
        let doc = self.documents.entry(id.clone()).or_default();
        doc.existing_in.insert(subscription.to_string());
        for (key, value) in fields {
            doc.change_field(subscription, &key, value, &mut changes, true);
        }

        if !is_new {
            return self.changed_message(id, &changes);
        }
        let fields: Document = changes
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect();
        Some(match before {
            Some(before) => ServerMessage::AddedBefore {
                collection: self.name.clone(),
                id,
                fields,
                before,
            },
            None => ServerMessage::Added {
                collection: self.name.clone(),
                id,
                fields,
            },
        })
    }

    /// `subscription` changes fields of a document it published.
    pub(crate) fn changed(
        &mut self,
        subscription: &str,
        id: DocumentId,
        fields: &ChangedFields,
    ) -> Result<Option<ServerMessage>> {
        let doc = self.documents.get_mut(&id).ok_or_else(|| {
            Error::invariant(format!("could not find {} in {} to change", id, self.name))
        })?;
        let mut changes = ChangedFields::new();
        for (key, value) in fields {
            match value {
                Some(value) => doc.change_field(subscription, key, value.clone(), &mut changes, false),
                None => doc.clear_field(subscription, key, &mut changes),
            }
        }
        Ok(self.changed_message(id, &changes))
    }

    /// Passes a position change through if the client has the document.
    pub(crate) fn moved_before(
        &self,
        id: DocumentId,
        before: Option<DocumentId>,
    ) -> Result<Option<ServerMessage>> {
        if !self.documents.contains_key(&id) {
            return Err(Error::invariant(format!("could not find {} in {} to move", id, self.name)));
        }
        Ok(Some(ServerMessage::MovedBefore {
            collection: self.name.clone(),
            id,
            before,
        }))
    }

    /// `subscription` withdraws a document. The client loses it once no
    /// subscription publishes it anymore.
    pub(crate) fn removed(&mut self, subscription: &str, id: DocumentId) -> Result<Option<ServerMessage>> {
        let doc = self.documents.get_mut(&id).ok_or_else(|| {
            Error::invariant(format!("removed nonexistent document {} from {}", id, self.name))
        })?;
        if !doc.existing_in.remove(subscription) {
            return Err(Error::invariant(format!(
                "subscription {} removed {} from {} without publishing it",
                subscription, id, self.name
            )));
        }

        if doc.existing_in.is_empty() {
            self.documents.remove(&id);
            return Ok(Some(ServerMessage::Removed {
                collection: self.name.clone(),
                id,
            }));
        }
        let mut changes = ChangedFields::new();
        let keys: Vec<String> = doc.data_by_key.keys().cloned().collect();
        for key in keys {
            doc.clear_field(subscription, &key, &mut changes);
        }
        Ok(self.changed_message(id, &changes))
    }

    fn changed_message(&self, id: DocumentId, changes: &ChangedFields) -> Option<ServerMessage> {
        if changes.is_empty() {
            None
        } else {
            Some(ServerMessage::changed(self.name.clone(), id, changes))
        }
    }
}
