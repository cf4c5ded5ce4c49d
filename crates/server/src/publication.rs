//! What one subscription has told its client.
//!
//! A [`SubscriptionView`] mirrors, per collection, the documents a
//! subscription has published and the fields last sent for each. Every
//! operation returns the event to send, or `None` when the client already
//! knows, so the view and the client's copy move in lock-step.

use livedata_core::diff::{apply_changes, make_changed_fields};
use livedata_core::value::{fields_of, values_equal};
use livedata_core::{ChangedFields, Document, DocumentId, Error, IdMap, ObserveEvent, Result};

/// Published documents of one subscription in one collection.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionView {
    ordered: bool,
    documents: IdMap<Document>,
    /// Publication order; maintained for ordered views only.
    order: Vec<DocumentId>,
}

impl SubscriptionView {
    pub fn new(ordered: bool) -> Self {
        Self {
            ordered,
            documents: IdMap::new(),
            order: Vec::new(),
        }
    }

    #[inline]
    pub fn ordered(&self) -> bool {
        self.ordered
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.documents.contains_key(id)
    }

    /// Fields last sent for `id`.
    pub fn get(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id)
    }

    /// Published ids; in publication order for ordered views.
    pub fn ids(&self) -> Vec<DocumentId> {
        if self.ordered {
            self.order.clone()
        } else {
            self.documents.keys().cloned().collect()
        }
    }

    /// Publishes a document at the end. Ignored if already published.
    pub fn added(&mut self, id: DocumentId, fields: Document) -> Option<ObserveEvent> {
        if self.documents.contains_key(&id) {
            return None;
        }
        let fields = fields_of(&fields);
        self.documents.insert(id.clone(), fields.clone());
        if self.ordered {
            self.order.push(id.clone());
            Some(ObserveEvent::AddedBefore {
                id,
                fields,
                before: None,
            })
        } else {
            Some(ObserveEvent::Added { id, fields })
        }
    }

    /// Publishes a document before `before` (`None` appends).
    pub fn added_before(
        &mut self,
        id: DocumentId,
        fields: Document,
        before: Option<DocumentId>,
    ) -> Result<Option<ObserveEvent>> {
        if !self.ordered {
            return Ok(self.added(id, fields));
        }
        if self.documents.contains_key(&id) {
            return Ok(None);
        }
        let at = self.insert_position(before.as_ref())?;
        let fields = fields_of(&fields);
        self.documents.insert(id.clone(), fields.clone());
        self.order.insert(at, id.clone());
        Ok(Some(ObserveEvent::AddedBefore { id, fields, before }))
    }

    /// Replaces the published fields of `id` with those of `doc` and
    /// returns only what differs: new or changed fields with their value,
    /// vanished fields cleared.
    pub fn changed(&mut self, id: &DocumentId, doc: &Document) -> Result<Option<ObserveEvent>> {
        let published = self.published_mut(id)?;
        let fields = fields_of(doc);
        let changes = make_changed_fields(&fields, published);
        *published = fields;
        Ok(Self::changed_event(id, changes))
    }

    /// Applies a field-level patch, dropping entries that change nothing.
    pub fn apply_changes(
        &mut self,
        id: &DocumentId,
        changes: &ChangedFields,
    ) -> Result<Option<ObserveEvent>> {
        let published = self.published_mut(id)?;
        let effective: ChangedFields = changes
            .iter()
            .filter(|(key, value)| match (value, published.get(key.as_str())) {
                (Some(new), Some(old)) => !values_equal(new, old),
                (Some(_), None) => true,
                (None, old) => old.is_some(),
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        apply_changes(published, &effective);
        Ok(Self::changed_event(id, effective))
    }

    /// Moves a published document before `before` (`None` moves it last).
    pub fn moved_before(
        &mut self,
        id: &DocumentId,
        before: Option<DocumentId>,
    ) -> Result<Option<ObserveEvent>> {
        if !self.documents.contains_key(id) {
            return Err(Error::invariant(format!("moved unpublished document {}", id)));
        }
        if !self.ordered {
            return Ok(None);
        }
        if before.as_ref() == Some(id) {
            return Err(Error::invariant(format!("{} moved before itself", id)));
        }
        let from = self.position(id)?;
        let next = self.order.get(from + 1);
        if next == before.as_ref() {
            return Ok(None);
        }
        self.order.remove(from);
        let at = self.insert_position(before.as_ref())?;
        self.order.insert(at, id.clone());
        Ok(Some(ObserveEvent::MovedBefore {
            id: id.clone(),
            before,
        }))
    }

    /// Withdraws a document. Ignored if not published.
    pub fn removed(&mut self, id: &DocumentId) -> Option<ObserveEvent> {
        self.documents.remove(id)?;
        if self.ordered {
            self.order.retain(|other| other != id);
        }
        Some(ObserveEvent::Removed { id: id.clone() })
    }

    fn published_mut(&mut self, id: &DocumentId) -> Result<&mut Document> {
        self.documents
            .get_mut(id)
            .ok_or_else(|| Error::invariant(format!("changed unpublished document {}", id)))
    }

    fn changed_event(id: &DocumentId, fields: ChangedFields) -> Option<ObserveEvent> {
        if fields.is_empty() {
            None
        } else {
            Some(ObserveEvent::Changed {
                id: id.clone(),
                fields,
            })
        }
    }

    fn position(&self, id: &DocumentId) -> Result<usize> {
        self.order
            .iter()
            .position(|other| other == id)
            .ok_or_else(|| Error::invariant(format!("{} missing from publication order", id)))
    }

    fn insert_position(&self, before: Option<&DocumentId>) -> Result<usize> {
        match before {
            Some(before) => self.position(before),
            None => Ok(self.order.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livedata_core::value::to_document;
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        to_document(value).unwrap()
    }

    fn ids(names: &[&str]) -> Vec<DocumentId> {
        names.iter().map(|n| DocumentId::from(*n)).collect()
    }

    #[test]
    fn test_changed_emits_minimal_diff() {
        let mut view = SubscriptionView::new(false);
        view.added("x".into(), doc(json!({"a": 1, "b": 2})));

        let event = view
            .changed(&"x".into(), &doc(json!({"_id": "x", "a": 1, "b": 3, "c": 4})))
            .unwrap();
        let mut expected = ChangedFields::new();
        expected.insert("b".into(), Some(json!(3)));
        expected.insert("c".into(), Some(json!(4)));
        assert_eq!(
            event,
            Some(ObserveEvent::Changed {
                id: "x".into(),
                fields: expected
            })
        );

        let event = view.changed(&"x".into(), &doc(json!({"a": 1, "c": 4}))).unwrap();
        match event {
            Some(ObserveEvent::Changed { fields, .. }) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields["b"], None);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(view.changed(&"x".into(), &doc(json!({"a": 1, "c": 4}))).unwrap(), None);
    }

    #[test]
    fn test_changed_unknown_id_fails() {
        let mut view = SubscriptionView::new(false);
        let err = view.changed(&"nope".into(), &doc(json!({"a": 1}))).unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(view.apply_changes(&"nope".into(), &ChangedFields::new()).is_err());
        assert!(view.is_empty());
    }

    #[test]
    fn test_add_and_remove_only_once() {
        let mut view = SubscriptionView::new(false);
        assert!(view.added("x".into(), doc(json!({"_id": "x", "a": 1}))).is_some());
        assert!(view.added("x".into(), doc(json!({"a": 2}))).is_none());
        assert_eq!(view.get(&"x".into()), Some(&doc(json!({"a": 1}))));
        assert!(view.removed(&"x".into()).is_some());
        assert!(view.removed(&"x".into()).is_none());
    }

    #[test]
    fn test_patch_drops_no_op_entries() {
        let mut view = SubscriptionView::new(false);
        view.added("x".into(), doc(json!({"a": 1})));
        let mut patch = ChangedFields::new();
        patch.insert("a".into(), Some(json!(1.0)));
        patch.insert("gone".into(), None);
        assert_eq!(view.apply_changes(&"x".into(), &patch).unwrap(), None);

        patch.insert("b".into(), Some(json!(true)));
        match view.apply_changes(&"x".into(), &patch).unwrap() {
            Some(ObserveEvent::Changed { fields, .. }) => {
                assert_eq!(fields.keys().collect::<Vec<_>>(), vec!["b"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ordered_positions() {
        let mut view = SubscriptionView::new(true);
        view.added("a".into(), Document::new());
        view.added("c".into(), Document::new());
        let event = view
            .added_before("b".into(), Document::new(), Some("c".into()))
            .unwrap();
        assert!(matches!(event, Some(ObserveEvent::AddedBefore { .. })));
        assert_eq!(view.ids(), ids(&["a", "b", "c"]));

        assert_eq!(view.moved_before(&"a".into(), Some("b".into())).unwrap(), None);
        assert!(view.moved_before(&"a".into(), None).unwrap().is_some());
        assert_eq!(view.ids(), ids(&["b", "c", "a"]));

        assert!(view.added_before("d".into(), Document::new(), Some("zz".into())).is_err());
        view.removed(&"c".into());
        assert_eq!(view.ids(), ids(&["b", "a"]));
    }
}
